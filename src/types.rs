//! Core types for cuckoo-cycle pool mining
//!
//! Target words, the difficulty codec, candidate cycles and the nonce
//! partition shared by the workers.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

/// Number of 32-bit words in a target or hash
pub const TARGET_WORDS: usize = 8;

/// Number of edges in a solution cycle
pub const PROOF_SIZE: usize = 42;

/// Numerator of the maximum pool target (difficulty 1)
pub const MAX_TARGET_NUMERATOR: f64 = 4_294_901_760.0;

const WORD_RANGE: f64 = 4_294_967_296.0;

/// 256-bit comparison target
///
/// Stored as eight 32-bit words, least significant first: word 7 decides
/// first when comparing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Target {
    words: [u32; TARGET_WORDS],
}

impl Target {
    /// Create a target from its words (index 7 is the most significant)
    pub fn new(words: [u32; TARGET_WORDS]) -> Self {
        Self { words }
    }

    /// Target words, least significant first
    pub fn words(&self) -> &[u32; TARGET_WORDS] {
        &self.words
    }

    /// Convert a pool difficulty into a target
    ///
    /// The difficulty is divided by 2^32 while it exceeds 1.0 (at most seven
    /// times); the word index where the division stops receives the low 32
    /// bits of `MAX_TARGET_NUMERATOR / diff` and the next word the high bits.
    pub fn from_difficulty(diff: f64) -> Result<Self> {
        if !diff.is_finite() || diff <= 0.0 {
            return Err(Error::target(format!(
                "difficulty must be a positive number, got {}",
                diff
            )));
        }

        let mut diff = diff;
        let mut k = TARGET_WORDS - 1;
        while k > 0 && diff > 1.0 {
            diff /= WORD_RANGE;
            k -= 1;
        }

        let m = (MAX_TARGET_NUMERATOR / diff) as u64;
        let mut words = [0u32; TARGET_WORDS];

        if k + 1 < TARGET_WORDS {
            words[k] = m as u32;
            words[k + 1] = (m >> 32) as u32;
        } else {
            // difficulty below 1: nothing above the top word, saturate it
            words[k] = u32::try_from(m).unwrap_or(u32::MAX);
        }

        Ok(Self { words })
    }

    /// Check whether a hash (as eight words) is at or below this target
    pub fn is_met_by(&self, hash: &[u32; TARGET_WORDS]) -> bool {
        meets_target(hash, &self.words)
    }

    /// Maximum possible target (easiest difficulty)
    pub fn max() -> Self {
        Self::new([u32::MAX; TARGET_WORDS])
    }

    /// Big-endian hex rendering, most significant word first
    pub fn to_hex_be(&self) -> String {
        self.words.iter().rev().map(|w| format!("{:08x}", w)).collect()
    }
}

/// Compare a hash against a target, most significant word first
///
/// The first unequal word decides; equal values pass.
pub fn meets_target(hash: &[u32; TARGET_WORDS], target: &[u32; TARGET_WORDS]) -> bool {
    for i in (0..TARGET_WORDS).rev() {
        if hash[i] > target[i] {
            return false;
        }
        if hash[i] < target[i] {
            return true;
        }
    }
    true
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != TARGET_WORDS * 8 {
            return Err(Error::target(format!(
                "Invalid target hex length: expected 64 chars, got {}",
                s.len()
            )));
        }

        let mut words = [0u32; TARGET_WORDS];
        for (i, word) in words.iter_mut().rev().enumerate() {
            let chunk = s
                .get(i * 8..(i + 1) * 8)
                .ok_or_else(|| Error::target("target is not ASCII hex"))?;
            *word = u32::from_str_radix(chunk, 16)
                .map_err(|e| Error::target(format!("Invalid hex in target: {}", e)))?;
        }

        Ok(Self::new(words))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex_be())
    }
}

impl Serialize for Target {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex_be())
    }
}

impl<'de> Deserialize<'de> for Target {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Target::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Candidate solution: the edge indices of one cycle in the graph
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Cycle(Vec<u32>);

impl Cycle {
    /// Create a cycle from edge indices
    pub fn new(edges: Vec<u32>) -> Self {
        Self(edges)
    }

    /// Edge indices in solver order
    pub fn edges(&self) -> &[u32] {
        &self.0
    }

    /// Number of edges
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the cycle holds no edges
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse one solver output line of comma-separated hex edge indices
    pub fn from_hex_list(line: &str) -> Result<Self> {
        line.split(',')
            .map(|edge| {
                u32::from_str_radix(edge.trim(), 16)
                    .map_err(|e| Error::solver(format!("invalid edge index {:?}: {}", edge, e)))
            })
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }
}

impl fmt::Display for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for edge in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{:x}", edge)?;
            first = false;
        }
        Ok(())
    }
}

/// Whether a loop is supposed to be executing
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotRunning = 0,
    Running = 1,
    Stopping = 2,
}

impl RunState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::NotRunning,
        }
    }
}

/// Atomic run state shared between a loop and the threads controlling it
///
/// Outside callers may only start a stopped loop or ask a running one to
/// stop; the loop itself reports when it is done.
#[derive(Debug)]
pub struct RunFlag(AtomicU8);

impl RunFlag {
    pub fn new() -> Self {
        Self(AtomicU8::new(RunState::NotRunning as u8))
    }

    pub fn get(&self) -> RunState {
        RunState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// NotRunning -> Running; false when the loop is already active
    pub fn start(&self) -> bool {
        self.0
            .compare_exchange(
                RunState::NotRunning as u8,
                RunState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Running -> Stopping; false when the loop was not running
    pub fn request_stop(&self) -> bool {
        self.0
            .compare_exchange(
                RunState::Running as u8,
                RunState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Called by the loop on its way out
    pub fn finish(&self) {
        self.0.store(RunState::NotRunning as u8, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.get() == RunState::Running
    }

    pub fn is_stopping(&self) -> bool {
        self.get() == RunState::Stopping
    }
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Slice of the 32-bit nonce space assigned to one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceRange {
    /// First nonce owned by the worker
    pub start: u32,
    /// Last nonce owned by the worker (inclusive)
    pub end: u32,
    /// Last nonce the worker will search (inclusive), `end` minus headroom
    pub limit: u32,
}

impl NonceRange {
    /// Equal partition of the nonce space for worker `index` of `total`
    pub fn partition(index: usize, total: usize, margin: u32) -> Self {
        let total = total.max(1) as u64;
        let index = (index as u64).min(total - 1);
        let range = u64::from(u32::MAX) / total;

        let start = range * index;
        let end = if index == total - 1 {
            u64::from(u32::MAX)
        } else {
            range * (index + 1) - 1
        };
        let limit = (range * (index + 1)).saturating_sub(u64::from(margin)).min(end);

        Self {
            start: start as u32,
            end: end as u32,
            limit: limit as u32,
        }
    }

    /// Whether the worker may still search `nonce`
    pub fn can_search(&self, nonce: u64) -> bool {
        nonce >= u64::from(self.start) && nonce <= u64::from(self.limit)
    }
}
