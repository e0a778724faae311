// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Decision rules used by the machines.

use crate::model::HaType;

/// A standby may serve once it is this close to the primary.
pub const CATCH_UP_THRESHOLD_BYTES: u64 = 80 * 1024 * 1024;

/// Disk usage, in percent, at which a node's storage is grown.
pub const DISK_USAGE_LIMIT_PERCENT: u8 = 90;

/// Parse a WAL location such as `16/B374D848` into a byte position.
pub fn parse_lsn(raw: &str) -> Option<u64> {
    let (hi, lo) = raw.trim().split_once('/')?;
    let hi = u64::from_str_radix(hi, 16).ok()?;
    let lo = u64::from_str_radix(lo, 16).ok()?;
    if hi > u32::MAX as u64 || lo > u32::MAX as u64 {
        return None;
    }
    Some((hi << 32) | lo)
}

/// Bytes the standby still has to replay.
pub fn wal_lag(primary_lsn: u64, replay_lsn: u64) -> u64 {
    primary_lsn.saturating_sub(replay_lsn)
}

/// Next move of a standby that is catching up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchUp {
    /// Too far behind, check again later.
    Lagging,
    /// Close enough and asynchronous: ready.
    Ready,
    /// Close enough, but must also be reported synchronous by the primary.
    AwaitSync,
}

pub fn catch_up_decision(lag_bytes: u64, ha: HaType) -> CatchUp {
    if lag_bytes > CATCH_UP_THRESHOLD_BYTES {
        CatchUp::Lagging
    } else if ha == HaType::Sync {
        CatchUp::AwaitSync
    } else {
        CatchUp::Ready
    }
}

/// Whether a `pg_stat_replication.sync_state` value counts as synchronous.
pub fn sync_state_ready(state: &str) -> bool {
    matches!(state.trim(), "quorum" | "sync")
}

/// New storage target after a disk-usage alarm: 1.5x the current target,
/// capped at `max_gib`. `None` when that would not grow the disk.
pub fn storage_autoresize(target_gib: i64, max_gib: i64) -> Option<i64> {
    let grown = (target_gib * 3 / 2).min(max_gib);
    (grown > target_gib).then_some(grown)
}

/// Parse `df --output=pcent` output such as `93%`.
pub fn parse_disk_usage(raw: &str) -> Option<u8> {
    raw.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())?
        .trim_end_matches('%')
        .trim()
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_autoresize() {
        assert_eq!(storage_autoresize(100, 4096), Some(150));
        assert_eq!(storage_autoresize(3000, 4096), Some(4096));
        assert_eq!(storage_autoresize(4096, 4096), None);
        assert_eq!(storage_autoresize(1, 4096), None);
    }

    #[test]
    fn test_parse_lsn() {
        assert_eq!(parse_lsn("0/3000000"), Some(0x3000000));
        assert_eq!(parse_lsn("16/B374D848"), Some((0x16 << 32) | 0xB374D848));
        assert_eq!(parse_lsn(" 1/0\n"), Some(1 << 32));
        assert_eq!(parse_lsn("garbage"), None);
        assert_eq!(parse_lsn("0/"), None);
    }

    #[test]
    fn test_catch_up_gating() {
        let limit = CATCH_UP_THRESHOLD_BYTES;
        assert_eq!(catch_up_decision(limit + 1, HaType::Async), CatchUp::Lagging);
        assert_eq!(catch_up_decision(limit, HaType::Async), CatchUp::Ready);
        assert_eq!(catch_up_decision(0, HaType::Sync), CatchUp::AwaitSync);
        assert_eq!(catch_up_decision(limit + 1, HaType::Sync), CatchUp::Lagging);
    }

    #[test]
    fn test_wal_lag_never_negative() {
        assert_eq!(wal_lag(100, 40), 60);
        assert_eq!(wal_lag(40, 100), 0);
    }

    #[test]
    fn test_sync_state() {
        assert!(sync_state_ready("quorum"));
        assert!(sync_state_ready("sync\n"));
        assert!(!sync_state_ready("async"));
        assert!(!sync_state_ready(""));
    }

    #[test]
    fn test_parse_disk_usage() {
        assert_eq!(parse_disk_usage("Use%\n 93%\n"), Some(93));
        assert_eq!(parse_disk_usage("42%"), Some(42));
        assert_eq!(parse_disk_usage(""), None);
    }
}
