use crate::decode::{decode, RegisterType, Value};
use crate::modbus::{BlockReader, HoldingRegisters};
use crate::registers::{RegisterDefinition, RegisterMap};
use chrono::{Local, NaiveDateTime};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

pub const UNKNOWN_SECTION: &str = "Unknown";

/// Address window whose populated offsets are announced by a 64-bit mask
/// stored in four registers at `mask_address`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub start: u16,
    pub end: u16,
    pub mask_address: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollPlan {
    Mask(Vec<Window>),
    Sweep { start: u16, end: u16 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct DecodedReading {
    pub address: u16,
    pub name: String,
    pub section: String,
    pub value: Option<Value>,
    pub unit: String,
    pub kind: RegisterType,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollStats {
    pub blocks_ok: u32,
    pub blocks_failed: u32,
    pub readings: usize,
    pub elapsed_ms: u64,
}

/// Result of one polling pass.
#[derive(Clone, Debug, PartialEq)]
pub struct PollPass {
    pub timestamp: NaiveDateTime,
    pub readings: Vec<DecodedReading>,
    pub stats: PollStats,
}

/// Big-endian composition of the four mask registers.
pub fn compose_mask(words: &[u16]) -> u64 {
    words
        .iter()
        .take(4)
        .fold(0u64, |acc, w| (acc << 16) | u64::from(*w))
}

/// Addresses of `window` whose bit (offset from the window start) is set.
pub fn masked_addresses(mask: u64, window: &Window) -> Vec<u16> {
    (window.start..=window.end)
        .filter(|a| {
            let bit = u32::from(a - window.start);
            bit < 64 && mask & (1u64 << bit) != 0
        })
        .collect()
}

/// Registers covered by the value starting at `def.address`: the type's
/// word count, or the rest of the range for ASCII strings. Never reaches
/// past `max_register`.
fn span(def: &RegisterDefinition, max_register: u16) -> u16 {
    let last = match def.kind {
        RegisterType::Ascii => u32::from(def.end_address),
        kind => u32::from(def.address) + u32::from(kind.word_count()) - 1,
    };
    let last = last.min(u32::from(max_register)).max(u32::from(def.address));
    (last - u32::from(def.address) + 1) as u16
}

/// Candidates plus the trailing words of every multi-register value.
/// Candidates that are themselves trailing words of a previous value are
/// not expanded again.
pub fn wanted_addresses(candidates: &[u16], map: &RegisterMap) -> BTreeSet<u16> {
    let mut wanted = BTreeSet::new();
    let mut next_free: u32 = 0;
    for &address in candidates {
        if u32::from(address) < next_free {
            continue;
        }
        wanted.insert(address);
        if let Some(def) = map.get(address) {
            let n = span(def, map.max_register());
            for extra in 1..n {
                if let Some(a) = address.checked_add(extra) {
                    wanted.insert(a);
                }
            }
            next_free = u32::from(address) + u32::from(n);
        }
    }
    wanted
}

/// Groups sorted addresses into contiguous `(start, count)` runs of at most
/// `block_size` registers.
pub fn partition_blocks(addresses: &BTreeSet<u16>, block_size: u16) -> Vec<(u16, u16)> {
    let block_size = block_size.max(1);
    let mut blocks: Vec<(u16, u16)> = vec![];
    for &address in addresses {
        match blocks.last_mut() {
            Some((start, count))
                if u32::from(*start) + u32::from(*count) == u32::from(address)
                    && *count < block_size =>
            {
                *count += 1;
            }
            _ => blocks.push((address, 1)),
        }
    }
    blocks
}

pub struct PollSession<'a, T: HoldingRegisters> {
    map: &'a RegisterMap,
    reader: BlockReader<T>,
    block_size: u16,
}

impl<'a, T: HoldingRegisters> PollSession<'a, T> {
    pub fn new(map: &'a RegisterMap, reader: BlockReader<T>, block_size: u16) -> Self {
        PollSession {
            map,
            reader,
            block_size,
        }
    }

    /// Runs one full pass over `plan`.
    pub fn run(&mut self, plan: &PollPlan) -> PollPass {
        let timestamp = Local::now().naive_local();
        let now = Instant::now();
        let mut readings = vec![];

        match plan {
            PollPlan::Mask(windows) => {
                for window in windows {
                    self.poll_window(window, &mut readings);
                }
            }
            PollPlan::Sweep { start, end } => {
                let candidates: Vec<u16> = (*start..=*end).collect();
                let words = self.fetch(&candidates);
                self.decode_all(&candidates, &words, true, &mut readings);
            }
        }

        let stats = PollStats {
            blocks_ok: self.reader.blocks_ok,
            blocks_failed: self.reader.blocks_failed,
            readings: readings.len(),
            elapsed_ms: now.elapsed().as_millis() as u64,
        };
        info!(
            "read {} registers in {} blocks, {} blocks unavailable [⏱ {} ms]",
            stats.readings, stats.blocks_ok, stats.blocks_failed, stats.elapsed_ms
        );
        PollPass {
            timestamp,
            readings,
            stats,
        }
    }

    fn poll_window(&mut self, window: &Window, readings: &mut Vec<DecodedReading>) {
        let mask = match self.reader.read_block(window.mask_address, 4) {
            Some(block) => compose_mask(&block.words),
            None => {
                error!(
                    "mask at 0x{:04X} unavailable, skipping window 0x{:04X}-0x{:04X}",
                    window.mask_address, window.start, window.end
                );
                return;
            }
        };
        debug!("window 0x{:04X}: mask {:016X}", window.start, mask);

        let candidates: Vec<u16> = masked_addresses(mask, window)
            .into_iter()
            .filter(|a| self.map.get(*a).map_or(false, |d| !d.name.is_empty()))
            .collect();
        let words = self.fetch(&candidates);
        self.decode_all(&candidates, &words, false, readings);
    }

    /// Reads every block needed for `candidates` into an address → word map,
    /// so values spanning two blocks can be put back together.
    fn fetch(&mut self, candidates: &[u16]) -> BTreeMap<u16, u16> {
        let wanted = wanted_addresses(candidates, self.map);
        let mut words = BTreeMap::new();
        for (start, count) in partition_blocks(&wanted, self.block_size) {
            if let Some(block) = self.reader.read_block(start, count) {
                for (i, w) in block.words.into_iter().enumerate() {
                    words.insert(start + i as u16, w);
                }
            }
        }
        words
    }

    fn decode_all(
        &self,
        candidates: &[u16],
        words: &BTreeMap<u16, u16>,
        report_unknown: bool,
        readings: &mut Vec<DecodedReading>,
    ) {
        // first address not consumed by the previous multi-register value
        let mut next_free: u32 = 0;
        for &address in candidates {
            if u32::from(address) < next_free {
                continue;
            }
            let def = self.map.get(address);
            if let Some(def) = def {
                next_free = u32::from(address) + u32::from(span(def, self.map.max_register()));
            }
            let first = match words.get(&address) {
                Some(w) => *w,
                None => continue,
            };

            match def {
                Some(def) => {
                    let n = span(def, self.map.max_register());
                    let available: Vec<u16> = (0..n)
                        .map_while(|i| address.checked_add(i).and_then(|a| words.get(&a)).copied())
                        .collect();
                    if available.len() < n as usize {
                        warn!(
                            "0x{:04X} {}: only {} of {} registers available",
                            address,
                            def.kind,
                            available.len(),
                            n
                        );
                    }
                    let name = if def.name.is_empty() {
                        format!("Register_{:04X}", address)
                    } else {
                        def.name.clone()
                    };
                    readings.push(DecodedReading {
                        address,
                        name,
                        section: def.section.clone(),
                        value: decode(&available, def.kind, def.accuracy),
                        unit: def.unit.clone(),
                        kind: def.kind,
                    });
                }
                None if report_unknown && first != 0 => {
                    readings.push(DecodedReading {
                        address,
                        name: format!("Unknown_{:04X}", address),
                        section: UNKNOWN_SECTION.to_string(),
                        value: decode(&[first], RegisterType::U16, 1.0),
                        unit: String::new(),
                        kind: RegisterType::U16,
                    });
                }
                None => {}
            }
        }
    }
}
