// Leaderboards Module
// User rankings from realized trading performance

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

use crate::error::{EngineError, Result};
use crate::models::Trade;
use crate::portfolio::{replay_realized, RealizedTrade};

// ==================== DATA STRUCTURES ====================
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub user_id: i64,
    pub rank: usize,
    pub total_pnl: Decimal,
    pub win_rate: Decimal,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub largest_win: Decimal,
    pub largest_loss: Decimal,
    pub total_volume: Decimal,
    pub avg_trade_size: Decimal,
    /// Positive for a run of wins, negative for losses, newest sells first.
    pub streak: i32,
}

#[derive(Debug, Serialize)]
pub struct Leaderboard {
    pub period: LeaderboardPeriod,
    pub metric: LeaderboardMetric,
    pub entries: Vec<LeaderboardEntry>,
    pub total_participants: usize,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaderboardPeriod {
    Daily,
    Weekly,
    Monthly,
    AllTime,
}

impl LeaderboardPeriod {
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            LeaderboardPeriod::Daily => Some(now - Duration::days(1)),
            LeaderboardPeriod::Weekly => Some(now - Duration::days(7)),
            LeaderboardPeriod::Monthly => Some(now - Duration::days(30)),
            LeaderboardPeriod::AllTime => None,
        }
    }
}

impl FromStr for LeaderboardPeriod {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "daily" => Ok(LeaderboardPeriod::Daily),
            "weekly" => Ok(LeaderboardPeriod::Weekly),
            "monthly" => Ok(LeaderboardPeriod::Monthly),
            "alltime" | "all_time" | "all-time" => Ok(LeaderboardPeriod::AllTime),
            other => Err(EngineError::Validation(format!("unknown period: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaderboardMetric {
    Pnl,
    Volume,
    Winrate,
}

impl FromStr for LeaderboardMetric {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pnl" => Ok(LeaderboardMetric::Pnl),
            "volume" => Ok(LeaderboardMetric::Volume),
            "winrate" | "win_rate" => Ok(LeaderboardMetric::Winrate),
            other => Err(EngineError::Validation(format!("unknown metric: {}", other))),
        }
    }
}

// ==================== LEADERBOARD CALCULATION ====================
fn user_stats(user_id: i64, realized: &[&RealizedTrade]) -> LeaderboardEntry {
    let mut total_pnl = Decimal::ZERO;
    let mut total_volume = Decimal::ZERO;
    let mut winning_trades = 0;
    let mut losing_trades = 0;
    let mut largest_win = Decimal::ZERO;
    let mut largest_loss = Decimal::ZERO;

    for trade in realized {
        total_volume += trade.volume;
        let Some(pnl) = trade.pnl else { continue };
        total_pnl += pnl;
        if pnl > Decimal::ZERO {
            winning_trades += 1;
            largest_win = largest_win.max(pnl);
        } else if pnl < Decimal::ZERO {
            losing_trades += 1;
            largest_loss = largest_loss.min(pnl);
        }
    }

    let mut streak = 0;
    for pnl in realized.iter().rev().filter_map(|t| t.pnl).take(10) {
        if pnl > Decimal::ZERO {
            if streak < 0 {
                break;
            }
            streak += 1;
        } else if pnl < Decimal::ZERO {
            if streak > 0 {
                break;
            }
            streak -= 1;
        }
    }

    let closed = winning_trades + losing_trades;
    let win_rate = if closed > 0 {
        (Decimal::from(winning_trades) / Decimal::from(closed) * Decimal::ONE_HUNDRED).round_dp(2)
    } else {
        Decimal::ZERO
    };
    let total_trades = realized.len();
    let avg_trade_size = if total_trades > 0 {
        total_volume / Decimal::from(total_trades)
    } else {
        Decimal::ZERO
    };

    LeaderboardEntry {
        user_id,
        rank: 0,
        total_pnl,
        win_rate,
        total_trades,
        winning_trades,
        losing_trades,
        largest_win,
        largest_loss,
        total_volume,
        avg_trade_size,
        streak,
    }
}

/// Ranks users over completed trades. Realized P&L is replayed from the
/// full history so averages opened before the window still count.
pub fn build_leaderboard(
    all_trades: &[Trade],
    period: LeaderboardPeriod,
    metric: LeaderboardMetric,
    limit: usize,
    now: DateTime<Utc>,
) -> Leaderboard {
    let cutoff = period.cutoff(now);
    let realized = replay_realized(all_trades);

    let mut by_user: HashMap<i64, Vec<&RealizedTrade>> = HashMap::new();
    for trade in &realized {
        if cutoff.map_or(true, |c| trade.completed_at >= c) {
            by_user.entry(trade.user_id).or_default().push(trade);
        }
    }

    let mut entries: Vec<LeaderboardEntry> = by_user
        .iter()
        .map(|(&user_id, trades)| user_stats(user_id, trades))
        .collect();

    entries.sort_by(|a, b| {
        let primary = match metric {
            LeaderboardMetric::Pnl => b.total_pnl.cmp(&a.total_pnl),
            LeaderboardMetric::Volume => b.total_volume.cmp(&a.total_volume),
            LeaderboardMetric::Winrate => b.win_rate.cmp(&a.win_rate),
        };
        primary.then(a.user_id.cmp(&b.user_id))
    });
    for (idx, entry) in entries.iter_mut().enumerate() {
        entry.rank = idx + 1;
    }

    let total_participants = entries.len();
    entries.truncate(limit);

    Leaderboard {
        period,
        metric,
        entries,
        total_participants,
        updated_at: now.timestamp(),
    }
}

pub fn get_user_position(user_id: i64, leaderboard: &Leaderboard) -> Option<&LeaderboardEntry> {
    leaderboard.entries.iter().find(|e| e.user_id == user_id)
}
