//! Pool jobs and search-ready work
//!
//! A [`Job`] is what the pool sends in `mining.notify`; a [`Work`] is the
//! assembled header, target and solution slot the workers grind on.

use crate::crypto;
use crate::types::{Cycle, Target, PROOF_SIZE};
use crate::{Error, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};

/// Number of 32-bit words in the header buffer
pub const WORK_WORDS: usize = 32;

/// Header word holding the nonce
pub const NONCE_INDEX: usize = 19;

const VERSION_INDEX: usize = 0;
const PREVHASH_INDEX: usize = 1;
const MERKLE_INDEX: usize = 9;
const TIME_INDEX: usize = 17;
const NBITS_INDEX: usize = 18;
const EDGE_BITS_INDEX: usize = 20;
const MARKER_INDEX: usize = 31;

/// Format-version bit stored under the edge bits
const EDGE_BITS_FORMAT_FLAG: u32 = 1 << 23;

/// Trailing marker word
const HEADER_MARKER: u32 = 0x0000_0288;

/// A unit of work assigned by the pool
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub prevhash: [u8; 32],
    /// Full coinbase: coinbase1, extranonce1, extranonce2 slot, coinbase2
    pub coinbase: Vec<u8>,
    pub xnonce2_start: usize,
    pub xnonce2_size: usize,
    pub merkle: Vec<[u8; 32]>,
    pub version: [u8; 4],
    pub nbits: [u8; 4],
    pub time: [u8; 4],
    pub edge_bits: u8,
    pub clean: bool,
    pub diff: f64,
}

impl Job {
    /// Extranonce2 bytes embedded in the coinbase
    pub fn xnonce2(&self) -> Result<&[u8]> {
        self.coinbase
            .get(self.xnonce2_start..self.xnonce2_start + self.xnonce2_size)
            .ok_or_else(|| {
                Error::work(format!(
                    "extranonce2 slot {}+{} outside coinbase of {} bytes",
                    self.xnonce2_start,
                    self.xnonce2_size,
                    self.coinbase.len()
                ))
            })
    }
}

/// Search-ready header, target and solution slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Work {
    pub job_id: String,
    pub data: [u32; WORK_WORDS],
    pub target: Target,
    pub cycle: [u32; PROOF_SIZE],
    pub xnonce2: Vec<u8>,
}

impl Work {
    /// Current nonce word
    pub fn nonce(&self) -> u32 {
        self.data[NONCE_INDEX]
    }

    /// Write the nonce word; the only header word workers touch
    pub fn set_nonce(&mut self, nonce: u32) {
        self.data[NONCE_INDEX] = nonce;
    }

    /// Edge-bit count encoded in the header
    pub fn edge_bits(&self) -> u8 {
        (self.data[EDGE_BITS_INDEX] >> 24) as u8
    }

    /// Header time word
    pub fn time(&self) -> u32 {
        self.data[TIME_INDEX]
    }

    /// Fill the solution slot
    pub fn set_cycle(&mut self, cycle: &Cycle) -> Result<()> {
        if cycle.len() != PROOF_SIZE {
            return Err(Error::work(format!(
                "cycle has {} edges, expected {}",
                cycle.len(),
                PROOF_SIZE
            )));
        }
        self.cycle.copy_from_slice(cycle.edges());
        Ok(())
    }

    /// Solution slot as a cycle
    pub fn cycle(&self) -> Cycle {
        Cycle::new(self.cycle.to_vec())
    }

    /// Serialized header that gets hashed: the words up to and including the
    /// nonce in little-endian order, then the edge-bits byte
    pub fn header_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; (NONCE_INDEX + 1) * 4 + 1];
        LittleEndian::write_u32_into(&self.data[..=NONCE_INDEX], &mut bytes[..(NONCE_INDEX + 1) * 4]);
        bytes[(NONCE_INDEX + 1) * 4] = self.edge_bits();
        bytes
    }

    /// Double hash of the header in hex, as consumed by cycle search
    pub fn header_hash_hex(&self) -> String {
        hex::encode(crypto::double_hash(&self.header_bytes()))
    }

    /// Same job content as `other`, ignoring the nonce and solution
    pub fn same_job(&self, other: &Work) -> bool {
        self.job_id == other.job_id && self.data[..NONCE_INDEX] == other.data[..NONCE_INDEX]
    }
}

/// Build search-ready work from a pool job
pub fn work_from_job(job: &Job) -> Result<Work> {
    let xnonce2 = job.xnonce2()?.to_vec();
    let merkle_root = crypto::merkle_root(&job.coinbase, &job.merkle);

    let mut data = [0u32; WORK_WORDS];
    data[VERSION_INDEX] = LittleEndian::read_u32(&job.version);
    LittleEndian::read_u32_into(
        &job.prevhash,
        &mut data[PREVHASH_INDEX..PREVHASH_INDEX + 8],
    );
    BigEndian::read_u32_into(&merkle_root, &mut data[MERKLE_INDEX..MERKLE_INDEX + 8]);
    data[TIME_INDEX] = LittleEndian::read_u32(&job.time);
    data[NBITS_INDEX] = LittleEndian::read_u32(&job.nbits);
    data[EDGE_BITS_INDEX] = (u32::from(job.edge_bits) << 24) | EDGE_BITS_FORMAT_FLAG;
    data[MARKER_INDEX] = HEADER_MARKER;

    Ok(Work {
        job_id: job.id.clone(),
        data,
        target: Target::from_difficulty(job.diff)?,
        cycle: [0u32; PROOF_SIZE],
        xnonce2,
    })
}

/// Encode a header word the way it went out on the wire
pub fn word_to_hex(word: u32) -> String {
    hex::encode(word.to_le_bytes())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_job() -> Job {
        let mut coinbase = hex::decode("01000000010000").unwrap();
        let xnonce2_start = coinbase.len();
        coinbase.extend_from_slice(&[0u8; 4]);
        coinbase.extend_from_slice(&hex::decode("ffffffff").unwrap());

        Job {
            id: "job-1".to_string(),
            prevhash: [0x11; 32],
            coinbase,
            xnonce2_start,
            xnonce2_size: 4,
            merkle: vec![[0x22; 32]],
            version: [0x01, 0x00, 0x00, 0x20],
            nbits: [0xff, 0xff, 0x00, 0x1d],
            time: [0x5a, 0x1b, 0x2c, 0x3d],
            edge_bits: 26,
            clean: true,
            diff: 1.0,
        }
    }

    #[test]
    fn test_work_from_job_layout() {
        let job = sample_job();
        let work = work_from_job(&job).unwrap();

        assert_eq!(work.job_id, "job-1");
        assert_eq!(work.data[0], 0x2000_0001);
        assert_eq!(work.data[1], 0x1111_1111);
        assert_eq!(work.data[17], 0x3d2c_1b5a);
        assert_eq!(work.data[18], 0x1d00_ffff);
        assert_eq!(work.data[20], (26 << 24) | (1 << 23));
        assert_eq!(work.data[31], 0x0000_0288);
        assert_eq!(work.nonce(), 0);
        assert_eq!(work.edge_bits(), 26);
        assert_eq!(work.xnonce2, vec![0u8; 4]);
        assert_eq!(work.target, Target::from_difficulty(1.0).unwrap());
    }

    #[test]
    fn test_merkle_words_are_big_endian() {
        let job = sample_job();
        let work = work_from_job(&job).unwrap();
        let root = crypto::merkle_root(&job.coinbase, &job.merkle);
        assert_eq!(
            work.data[9],
            u32::from_be_bytes([root[0], root[1], root[2], root[3]])
        );
    }

    #[test]
    fn test_work_from_job_is_deterministic() {
        let job = sample_job();
        assert_eq!(work_from_job(&job).unwrap(), work_from_job(&job).unwrap());
    }

    #[test]
    fn test_same_job_ignores_nonce() {
        let job = sample_job();
        let a = work_from_job(&job).unwrap();
        let mut b = a.clone();
        b.set_nonce(77);
        assert!(a.same_job(&b));

        let mut later = job.clone();
        later.time = [0, 0, 0, 1];
        assert!(!a.same_job(&work_from_job(&later).unwrap()));
    }

    #[test]
    fn test_header_bytes_carry_nonce_and_edge_bits() {
        let mut work = work_from_job(&sample_job()).unwrap();
        work.set_nonce(0x0403_0201);
        let bytes = work.header_bytes();
        assert_eq!(bytes.len(), 81);
        assert_eq!(&bytes[76..80], &[1, 2, 3, 4]);
        assert_eq!(bytes[80], 26);
    }

    #[test]
    fn test_set_cycle_checks_length() {
        let mut work = work_from_job(&sample_job()).unwrap();
        assert!(work.set_cycle(&Cycle::new(vec![1, 2, 3])).is_err());

        let edges: Vec<u32> = (0..PROOF_SIZE as u32).collect();
        work.set_cycle(&Cycle::new(edges.clone())).unwrap();
        assert_eq!(work.cycle().edges(), edges.as_slice());
    }

    #[test]
    fn test_zero_difficulty_is_rejected() {
        let mut job = sample_job();
        job.diff = 0.0;
        assert!(work_from_job(&job).is_err());
    }

    #[test]
    fn test_word_to_hex_round_trips_wire_bytes() {
        let work = work_from_job(&sample_job()).unwrap();
        assert_eq!(word_to_hex(work.time()), "5a1b2c3d");
    }
}
