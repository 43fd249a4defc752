//! In-process per-principal rate limiting over a rolling minute. State
//! never leaves the process; over-quota requests fail before any routing.

use std::collections::HashMap;

use crate::{GatewayError, Result};

#[derive(Debug, Default)]
pub struct RateLimiter {
    rpm: Option<u32>,
    usage: HashMap<i64, MinuteUsage>,
    last_gc_minute: u64,
}

#[derive(Debug, Clone)]
struct MinuteUsage {
    minute: u64,
    requests: u32,
}

impl RateLimiter {
    pub fn new(rpm: Option<u32>) -> Self {
        Self {
            rpm,
            usage: HashMap::new(),
            last_gc_minute: 0,
        }
    }

    pub fn check_and_consume(&mut self, principal_id: i64, minute: u64) -> Result<()> {
        let Some(rpm) = self.rpm else {
            return Ok(());
        };

        if minute != self.last_gc_minute {
            // Only the active minute bucket is live state.
            self.usage.retain(|_, usage| usage.minute == minute);
            self.last_gc_minute = minute;
        }

        let usage = self
            .usage
            .entry(principal_id)
            .or_insert(MinuteUsage { minute, requests: 0 });
        if usage.minute != minute {
            usage.minute = minute;
            usage.requests = 0;
        }

        let next = usage.requests.saturating_add(1);
        if rpm == 0 || next > rpm {
            return Err(GatewayError::RateLimited {
                limit: format!("rpm>{rpm}"),
            });
        }
        usage.requests = next;
        Ok(())
    }
}
