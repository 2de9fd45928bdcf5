use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Custom epoch: 2024-01-01T00:00:00Z in milliseconds since Unix epoch.
const MARQUEE_EPOCH_MS: u64 = 1_704_067_200_000;

const WORKER_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const MAX_WORKER_ID: u16 = (1 << WORKER_BITS) - 1;

struct State {
    last_ms: u64,
    sequence: u64,
}

/// 64-bit snowflake generator used for session ids.
///
/// Layout (MSB to LSB):
/// - Bits 63..22: ms since the Marquee epoch (42 bits)
/// - Bits 21..12: worker id (10 bits)
/// - Bits 11..0: per-ms sequence
///
/// Ids are strictly increasing per generator. If the wall clock steps
/// backwards the generator keeps counting from the last timestamp it issued
/// instead of failing.
pub struct SnowflakeGenerator {
    worker_id: u64,
    state: Mutex<State>,
}

impl SnowflakeGenerator {
    /// Worker ids wider than 10 bits are masked down.
    pub fn new(worker_id: u16) -> Self {
        Self {
            worker_id: u64::from(worker_id & MAX_WORKER_ID),
            state: Mutex::new(State {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    pub fn generate(&self) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let now_ms = current_ms().max(state.last_ms);

        if now_ms == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // Sequence exhausted for this millisecond; borrow the next one.
                state.last_ms += 1;
            }
        } else {
            state.sequence = 0;
            state.last_ms = now_ms;
        }

        let ts = state.last_ms.saturating_sub(MARQUEE_EPOCH_MS);
        (ts << (WORKER_BITS + SEQUENCE_BITS)) | (self.worker_id << SEQUENCE_BITS) | state.sequence
    }
}

fn current_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(MARQUEE_EPOCH_MS)
}

/// Extract the creation timestamp (ms since Unix epoch) from a snowflake id.
pub fn snowflake_timestamp_ms(id: u64) -> u64 {
    (id >> (WORKER_BITS + SEQUENCE_BITS)) + MARQUEE_EPOCH_MS
}
