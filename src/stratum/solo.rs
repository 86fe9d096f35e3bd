//! Solo mining against a node's `getblocktemplate`

use super::connection::{self, PoolAddress};
use crate::crypto;
use crate::work::Job;
use crate::{Error, Result};
use serde::Deserialize;
use serde_json::json;
use std::io::{BufRead, BufReader, Read, Write};
use std::time::Duration;
use tracing::debug;

/// Longest wait for a template response
const TEMPLATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Block template as returned by the node
#[derive(Debug, Clone, Deserialize)]
pub struct BlockTemplate {
    pub bits: String,
    #[serde(rename = "previousblockhash")]
    pub previous_block_hash: String,
    #[serde(rename = "curtime")]
    pub current_time: u32,
    pub version: u32,
    #[serde(rename = "edgebits")]
    pub edge_bits: u8,
    #[serde(rename = "coinbasetxn")]
    pub coinbase_txn: CoinbaseTxn,
    #[serde(default)]
    pub transactions: Vec<TemplateTransaction>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoinbaseTxn {
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateTransaction {
    #[serde(alias = "hash")]
    pub txid: String,
}

#[derive(Debug, Deserialize)]
struct RpcReply {
    result: Option<BlockTemplate>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// Fetch a template over a fresh connection and turn it into a job
pub fn fetch_template(address: &PoolAddress, auth_token: &str) -> Result<BlockTemplate> {
    let body = json!({
        "jsonrpc": "1.0",
        "id": "merit-miner",
        "method": "getblocktemplate",
        "params": [{"capabilities": ["coinbasetxn", "workid", "coinbase/append"]}],
    })
    .to_string();

    let request = format!(
        "POST / HTTP/1.1\r\n\
         Host: {}\r\n\
         Authorization: Basic {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        address,
        auth_token,
        body.len(),
        body
    );

    let mut stream = connection::open(address)?;
    stream.set_read_timeout(Some(TEMPLATE_TIMEOUT))?;
    stream
        .write_all(request.as_bytes())
        .map_err(|e| Error::network(format!("template request failed: {}", e)))?;

    let mut reader = BufReader::new(stream);
    skip_headers(&mut reader)?;

    let mut response = String::new();
    reader
        .read_to_string(&mut response)
        .map_err(|e| Error::network(format!("template response failed: {}", e)))?;
    debug!("Template response of {} bytes", response.len());

    parse_reply(&response)
}

/// Drop the status and header lines up to the blank separator line
fn skip_headers(reader: &mut impl BufRead) -> Result<()> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(Error::network("template response ended inside headers"));
        }
        if line.trim().is_empty() {
            return Ok(());
        }
    }
}

fn parse_reply(body: &str) -> Result<BlockTemplate> {
    let reply: RpcReply = serde_json::from_str(body.trim())?;
    match (reply.result, reply.error) {
        (Some(template), _) => Ok(template),
        (None, Some(error)) if !error.is_null() => {
            Err(Error::stratum(format!("getblocktemplate failed: {}", error)))
        }
        _ => Err(Error::stratum("getblocktemplate returned no template")),
    }
}

/// Convert a template into a job
///
/// Hashes in the template are in display order and get reversed to the
/// byte order the header uses. Solo jobs carry no extranonce2.
pub fn template_to_job(template: &BlockTemplate, id: String, diff: f64) -> Result<Job> {
    let prevhash = reversed_hash(&template.previous_block_hash, "previousblockhash")?;

    let bits = u32::from_str_radix(&template.bits, 16)
        .map_err(|e| Error::protocol(format!("invalid bits {:?}: {}", template.bits, e)))?;

    let txids = template
        .transactions
        .iter()
        .map(|tx| reversed_hash(&tx.txid, "txid"))
        .collect::<Result<Vec<_>>>()?;

    let coinbase = hex::decode(&template.coinbase_txn.data)?;

    Ok(Job {
        id,
        prevhash,
        xnonce2_start: coinbase.len(),
        xnonce2_size: 0,
        coinbase,
        merkle: crypto::merkle_steps(&txids),
        version: template.version.to_le_bytes(),
        nbits: bits.to_le_bytes(),
        time: template.current_time.to_le_bytes(),
        edge_bits: template.edge_bits,
        clean: true,
        diff,
    })
}

fn reversed_hash(hex_str: &str, field: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_str)?;
    let mut hash = <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| Error::protocol(format!("{} must be 32 bytes", field)))?;
    hash.reverse();
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::work_from_job;
    use std::io::Cursor;

    fn template_json() -> String {
        json!({
            "result": {
                "bits": "1d00ffff",
                "previousblockhash": format!("{}{}", "00".repeat(31), "ab"),
                "curtime": 0x5a1b2c3d_u32,
                "version": 0x2000_0001_u32,
                "edgebits": 24,
                "coinbasetxn": {"data": "01000000ff"},
                "transactions": [{"txid": "11".repeat(32)}, {"txid": "22".repeat(32)}],
            },
            "error": null,
            "id": "merit-miner",
        })
        .to_string()
    }

    #[test]
    fn test_skip_headers() {
        let raw = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nDate: x\r\nContent-Length: 2\r\n\r\n{}";
        let mut reader = Cursor::new(raw.as_bytes());
        skip_headers(&mut reader).unwrap();
        let mut rest = String::new();
        reader.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "{}");

        let mut truncated = Cursor::new(b"HTTP/1.1 200 OK\r\n".as_slice());
        assert!(skip_headers(&mut truncated).is_err());
    }

    #[test]
    fn test_template_to_job() {
        let template = parse_reply(&template_json()).unwrap();
        let job = template_to_job(&template, "7".to_string(), 4.0).unwrap();

        assert_eq!(job.id, "7");
        assert_eq!(job.prevhash[0], 0xab);
        assert_eq!(job.nbits, [0xff, 0xff, 0x00, 0x1d]);
        assert_eq!(job.time, 0x5a1b2c3d_u32.to_le_bytes());
        assert_eq!(job.edge_bits, 24);
        assert_eq!(job.xnonce2_size, 0);
        assert_eq!(job.merkle.len(), 2);
        assert_eq!(job.diff, 4.0);

        let work = work_from_job(&job).unwrap();
        assert_eq!(work.data[18], 0x1d00_ffff);
        assert_eq!(work.data[0], 0x2000_0001);
        assert!(work.xnonce2.is_empty());
    }

    #[test]
    fn test_template_error_reply() {
        let body = r#"{"result":null,"error":{"code":-10,"message":"not connected"},"id":1}"#;
        assert!(parse_reply(body).is_err());
    }
}
