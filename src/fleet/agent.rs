//! Per-account trading agent loop.
//!
//! One task per account runs `run_agent_loop`: each tick it syncs market
//! state, scans for opportunities, filters them through the strategy's
//! thresholds and proposes survivors to the governor. Transient data errors
//! retry with bounded backoff inside the tick; fatal errors and panics are
//! isolated to this account by the caller-supplied status transition.

use chrono::Utc;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info};

use crate::errors::AgentError;
use crate::execution::ExecutionVenue;
use crate::fleet::account::AccountHandle;
use crate::fleet::governor::{Authorization, RiskGovernor};
use crate::fleet::logbuf::LogBuffer;
use crate::market::{MarketData, MarketQuote};
use crate::models::{worst_case_loss, AccountStatus, Opportunity, Side, TradeProposal};
use crate::strategy::{implied_confidence, kelly_stake, SizingParams, Strategy};

/// Fractional Kelly applied to every stake.
const KELLY_FRACTION: f64 = 0.25;
const MIN_POSITION_USD: f64 = 1.0;

/// Bounded backoff for transient data-source errors within one tick.
const SCAN_RETRY_BASE_MS: u64 = 50;
const SCAN_MAX_ATTEMPTS: u32 = 3;

/// Everything one agent loop needs. Cheap to clone; all members are shared.
#[derive(Clone)]
pub struct AgentContext {
    pub account: AccountHandle,
    pub strategy: Arc<dyn Strategy>,
    pub market: Arc<dyn MarketData>,
    pub venue: Arc<dyn ExecutionVenue>,
    pub governor: Arc<RiskGovernor>,
    pub logs: Arc<LogBuffer>,
    pub tick_interval: Duration,
}

#[derive(Debug)]
pub enum AgentCommand {
    /// Manual execute action routed from the API.
    Execute {
        opportunity_id: String,
        reply: oneshot::Sender<ExecuteOutcome>,
    },
}

#[derive(Debug, Clone)]
pub struct ExecuteOutcome {
    pub success: bool,
    pub reason: String,
}

impl ExecuteOutcome {
    fn ok(reason: impl Into<String>) -> Self {
        Self {
            success: true,
            reason: reason.into(),
        }
    }

    fn fail(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: reason.into(),
        }
    }
}

/// The agent task. Exits at the next tick boundary after a stop/kill signal,
/// when the account leaves `Active`, or when a fault is isolated.
pub async fn run_agent_loop(
    ctx: AgentContext,
    mut stop_rx: watch::Receiver<bool>,
    mut kill_rx: watch::Receiver<bool>,
    mut commands: mpsc::Receiver<AgentCommand>,
) {
    let mut ticker = interval(ctx.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(account = %ctx.account.id, strategy = ctx.account.strategy.as_str(), "agent loop started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if *stop_rx.borrow() || *kill_rx.borrow() || !ctx.account.is_active() {
                    break;
                }
                match AssertUnwindSafe(run_tick(&ctx)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) if err.is_fatal() => {
                        isolate_fault(&ctx, &err.to_string());
                        break;
                    }
                    Ok(Err(AgentError::TransientData(reason))) => {
                        ctx.logs.warning(
                            Some(&ctx.account.id),
                            format!("tick skipped after retries: {reason}"),
                        );
                    }
                    Ok(Err(err)) => {
                        debug!(account = %ctx.account.id, error = %err, "tick error absorbed");
                    }
                    Err(panic) => {
                        isolate_fault(&ctx, &panic_message(panic));
                        break;
                    }
                }
            }
            maybe_cmd = commands.recv() => {
                match maybe_cmd {
                    Some(AgentCommand::Execute { opportunity_id, reply }) => {
                        let outcome = handle_execute(&ctx, &opportunity_id).await;
                        let _ = reply.send(outcome);
                    }
                    None => break,
                }
            }
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            changed = kill_rx.changed() => {
                if changed.is_err() || *kill_rx.borrow() {
                    break;
                }
            }
        }
    }

    info!(account = %ctx.account.id, "agent loop exited");
}

/// One scan -> evaluate -> propose -> execute pass.
pub async fn run_tick(ctx: &AgentContext) -> Result<(), AgentError> {
    let now = Utc::now();

    ctx.governor
        .sync_market_state(&ctx.account.id, ctx.market.as_ref());

    let quotes = scan_quotes_with_backoff(ctx).await?;
    let mut candidates = ctx
        .strategy
        .scan(&ctx.account.id, &quotes, now);
    candidates.retain(|opp| ctx.strategy.evaluate(opp));

    {
        let mut state = ctx.account.state.lock();
        state.prune_expired_opportunities(now);
        for opp in &candidates {
            state.record_opportunity(opp.clone());
        }
    }

    for opp in candidates {
        match propose_and_execute(ctx, &opp).await {
            Ok(()) => {}
            Err(AgentError::Validation(reason)) => {
                debug!(account = %ctx.account.id, market = %opp.market_id, %reason, "proposal rejected");
            }
            Err(AgentError::Execution(reason)) => {
                ctx.logs.warning(
                    Some(&ctx.account.id),
                    format!("execution failed on {}: {reason}", opp.market_id),
                );
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                debug!(account = %ctx.account.id, error = %err, "proposal error absorbed");
            }
        }
        // Stop proposing as soon as the account leaves Active mid-tick.
        if !ctx.account.is_active() {
            break;
        }
    }

    Ok(())
}

async fn scan_quotes_with_backoff(ctx: &AgentContext) -> Result<Vec<MarketQuote>, AgentError> {
    let mut delay = Duration::from_millis(SCAN_RETRY_BASE_MS);
    let mut attempt = 1;
    loop {
        match ctx.market.poll_quotes(ctx.account.strategy).await {
            Ok(quotes) => return Ok(quotes),
            Err(err) if err.is_transient() && attempt < SCAN_MAX_ATTEMPTS => {
                debug!(
                    account = %ctx.account.id,
                    attempt,
                    error = %err,
                    "scan retry after transient error"
                );
                sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Size the stake, ask the governor, then hand the trade to the venue. The
/// reservation is returned on any venue failure so capacity never leaks.
pub async fn propose_and_execute(ctx: &AgentContext, opp: &Opportunity) -> Result<(), AgentError> {
    if opp.is_expired(Utc::now()) {
        return Err(AgentError::validation("opportunity expired"));
    }

    let capital = ctx.account.state.lock().capital_usd;
    let params = SizingParams {
        capital_usd: capital,
        kelly_fraction: KELLY_FRACTION,
        max_position_pct: ctx.account.limits.max_position_pct,
        min_position_usd: MIN_POSITION_USD,
    };
    let price_basis = match opp.side {
        Side::Buy => opp.entry_price,
        Side::Sell => 1.0 - opp.entry_price,
    };
    let stake = kelly_stake(implied_confidence(opp), price_basis, &params);
    if stake <= 0.0 {
        return Err(AgentError::validation("no stake at current edge"));
    }

    let proposal = TradeProposal {
        opportunity_id: opp.id.clone(),
        market_id: opp.market_id.clone(),
        side: opp.side,
        size_usd: stake,
        limit_price: opp.entry_price,
        worst_case_loss_usd: worst_case_loss(opp.side, stake, opp.entry_price),
    };

    match ctx.governor.authorize(&ctx.account.id, &proposal) {
        Authorization::Rejected { reason } => Err(AgentError::Validation(reason)),
        Authorization::Approved(reservation) => {
            match ctx.strategy.execute(ctx.venue.as_ref(), opp, stake).await {
                Ok(fill) => {
                    ctx.governor.apply_fill(&reservation, opp, &fill);
                    ctx.logs.info(
                        Some(&ctx.account.id),
                        format!(
                            "opened ${:.2} on {} @ {:.3}",
                            fill.filled_notional_usd, opp.market_id, fill.filled_price
                        ),
                    );
                    Ok(())
                }
                Err(err) => {
                    ctx.governor.release(&reservation, &err.to_string());
                    Err(AgentError::execution(err.to_string()))
                }
            }
        }
    }
}

async fn handle_execute(ctx: &AgentContext, opportunity_id: &str) -> ExecuteOutcome {
    let Some(opp) = ctx.account.state.lock().find_opportunity(opportunity_id) else {
        return ExecuteOutcome::fail("unknown opportunity");
    };
    if opp.is_expired(Utc::now()) {
        return ExecuteOutcome::fail("opportunity expired");
    }
    match propose_and_execute(ctx, &opp).await {
        Ok(()) => ExecuteOutcome::ok("executed"),
        Err(err) => ExecuteOutcome::fail(err.to_string()),
    }
}

/// Transition this account to `Error` exactly once and record the fault.
/// Every other account's loop is untouched.
fn isolate_fault(ctx: &AgentContext, message: &str) {
    let newly_failed = {
        let mut state = ctx.account.state.lock();
        if state.status != AccountStatus::Error {
            state.status = AccountStatus::Error;
            true
        } else {
            false
        }
    };
    if newly_failed {
        ctx.logs.critical(
            Some(&ctx.account.id),
            format!("unhandled fault isolated: {message}"),
        );
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
