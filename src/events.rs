//! Log parsing and event decoding for the two DLN programs.
//!
//! Solana transactions carry an ordered list of log messages in which
//! program invocations form nested frames:
//!
//! ```text
//! Program <addr> invoke [1]
//! Program data: <base64 payload>
//! Program <inner> invoke [2]
//! ...
//! Program <inner> success
//! Program <addr> success
//! ```
//!
//! Only `Program data:` lines whose innermost enclosing frame belongs to the
//! target program are treated as its emissions; payloads logged by CPI-called
//! programs are ignored. Each payload starts with an 8-byte Anchor event
//! discriminator followed by a little-endian struct body.

use base64::Engine;
use solana_sdk::pubkey::Pubkey;
use tracing::debug;

/// Compute the Anchor event discriminator: `sha256("event:<Name>")[..8]`.
fn event_discriminator(event_name: &str) -> [u8; 8] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(format!("event:{event_name}"));
    let hash = hasher.finalize();
    let mut disc = [0u8; 8];
    disc.copy_from_slice(&hash[..8]);
    disc
}

/// One side of an order: chain, token and amount.
///
/// `chain_id` and `amount` are 256-bit big-endian integers; `token_address`
/// is chain-specific (exactly 32 bytes for Solana mints).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    pub chain_id: [u8; 32],
    pub token_address: Vec<u8>,
    pub amount: [u8; 32],
}

/// Full order body carried by the `CreatedOrder` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBody {
    pub maker_order_nonce: u64,
    pub maker_src: Vec<u8>,
    pub give: Offer,
    pub take: Offer,
    pub receiver_dst: Vec<u8>,
    pub give_patch_authority_src: Vec<u8>,
    pub order_authority_address_dst: Vec<u8>,
    pub allowed_taker_dst: Option<Vec<u8>>,
    pub allowed_cancel_beneficiary_src: Option<Vec<u8>>,
    pub external_call: Option<Vec<u8>>,
}

/// A decoded emission of one of the DLN programs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramEvent {
    CreatedOrder(OrderBody),
    CreatedOrderId([u8; 32]),
    Fulfilled { order_id: [u8; 32], taker: [u8; 32] },
}

/// A created order paired from `CreatedOrder` + `CreatedOrderId` in the same
/// transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedOrder {
    pub order_id: [u8; 32],
    pub give: Offer,
}

/// Little-endian payload reader. Every accessor returns `None` past the end
/// so malformed payloads fail the whole event instead of panicking.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        Some(self.bytes(1)?[0])
    }

    fn u64(&mut self) -> Option<u64> {
        Some(u64::from_le_bytes(self.bytes(8)?.try_into().ok()?))
    }

    fn u32(&mut self) -> Option<u32> {
        Some(u32::from_le_bytes(self.bytes(4)?.try_into().ok()?))
    }

    fn array32(&mut self) -> Option<[u8; 32]> {
        self.bytes(32)?.try_into().ok()
    }

    /// `u32` length prefix followed by that many bytes.
    fn vec(&mut self) -> Option<Vec<u8>> {
        let len = self.u32()? as usize;
        Some(self.bytes(len)?.to_vec())
    }

    /// `Option<Vec<u8>>` encoded as a 0/1 tag byte then the value.
    fn option_vec(&mut self) -> Option<Option<Vec<u8>>> {
        match self.u8()? {
            0 => Some(None),
            1 => Some(Some(self.vec()?)),
            _ => None,
        }
    }
}

fn decode_offer(r: &mut Reader) -> Option<Offer> {
    Some(Offer {
        chain_id: r.array32()?,
        token_address: r.vec()?,
        amount: r.array32()?,
    })
}

fn decode_order_body(r: &mut Reader) -> Option<OrderBody> {
    Some(OrderBody {
        maker_order_nonce: r.u64()?,
        maker_src: r.vec()?,
        give: decode_offer(r)?,
        take: decode_offer(r)?,
        receiver_dst: r.vec()?,
        give_patch_authority_src: r.vec()?,
        order_authority_address_dst: r.vec()?,
        allowed_taker_dst: r.option_vec()?,
        allowed_cancel_beneficiary_src: r.option_vec()?,
        external_call: r.option_vec()?,
    })
}

/// Collect the base64 `Program data:` payloads emitted directly by `program`,
/// honoring invoke/success/failed frame nesting.
fn program_data_payloads(logs: &[String], program: &str) -> Vec<Vec<u8>> {
    let mut stack: Vec<&str> = Vec::new();
    let mut payloads = Vec::new();

    for line in logs {
        if let Some(data) = line.strip_prefix("Program data: ") {
            if stack.last().copied() != Some(program) {
                continue;
            }
            match base64::engine::general_purpose::STANDARD.decode(data.trim()) {
                Ok(bytes) => payloads.push(bytes),
                Err(e) => debug!(error = %e, "Failed to decode base64 log data"),
            }
        } else if let Some(rest) = line.strip_prefix("Program ") {
            let mut parts = rest.split_whitespace();
            let (Some(addr), Some(verb)) = (parts.next(), parts.next()) else {
                continue;
            };
            match verb {
                "invoke" => stack.push(addr),
                "success" => {
                    stack.pop();
                }
                v if v.starts_with("failed") => {
                    stack.pop();
                }
                _ => {}
            }
        }
    }

    payloads
}

/// Decode every recognized event emitted by `program` in one transaction.
///
/// Payloads that fail to decode are skipped individually; a transaction with
/// only malformed payloads simply yields no events.
pub fn decode_events(logs: &[String], program: &Pubkey) -> Vec<ProgramEvent> {
    let created_order = event_discriminator("CreatedOrder");
    let created_order_id = event_discriminator("CreatedOrderId");
    let fulfilled = event_discriminator("Fulfilled");

    let target = program.to_string();
    let mut events = Vec::new();

    for payload in program_data_payloads(logs, &target) {
        if payload.len() < 8 {
            continue;
        }
        let disc: [u8; 8] = match payload[..8].try_into() {
            Ok(disc) => disc,
            Err(_) => continue,
        };
        let mut r = Reader::new(&payload[8..]);

        let event = if disc == created_order {
            decode_order_body(&mut r).map(ProgramEvent::CreatedOrder)
        } else if disc == created_order_id {
            r.array32().map(ProgramEvent::CreatedOrderId)
        } else if disc == fulfilled {
            // Trailing bytes are tolerated for appended fields.
            match (r.array32(), r.array32()) {
                (Some(order_id), Some(taker)) => Some(ProgramEvent::Fulfilled { order_id, taker }),
                _ => None,
            }
        } else {
            continue;
        };

        match event {
            Some(e) => events.push(e),
            None => debug!("Failed to decode event payload, skipping"),
        }
    }

    events
}

/// Pair `CreatedOrder` bodies with `CreatedOrderId` ids in order of
/// appearance. An order is only valid with both halves present; unpaired
/// leftovers are dropped.
pub fn paired_created_orders(events: &[ProgramEvent]) -> Vec<CreatedOrder> {
    let bodies = events.iter().filter_map(|e| match e {
        ProgramEvent::CreatedOrder(body) => Some(body),
        _ => None,
    });
    let ids = events.iter().filter_map(|e| match e {
        ProgramEvent::CreatedOrderId(id) => Some(*id),
        _ => None,
    });

    bodies
        .zip(ids)
        .map(|(body, order_id)| CreatedOrder {
            order_id,
            give: body.give.clone(),
        })
        .collect()
}

/// Fulfilled events in order of appearance.
pub fn fulfilled_orders(events: &[ProgramEvent]) -> Vec<([u8; 32], [u8; 32])> {
    events
        .iter()
        .filter_map(|e| match e {
            ProgramEvent::Fulfilled { order_id, taker } => Some((*order_id, *taker)),
            _ => None,
        })
        .collect()
}
