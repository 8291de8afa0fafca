use crate::config::{SerialConfig, MODBUS_MAX_BLOCK};
use crate::error::{PollError, Result};
use std::time::{Duration, Instant};
use tokio_modbus::client::sync::{rtu, Context};
use tokio_modbus::prelude::*;

/// A contiguous run of register words from one read.
#[derive(Clone, Debug, PartialEq)]
pub struct RawRegisterBlock {
    pub start_address: u16,
    pub words: Vec<u16>,
}

/// Anything that answers "read holding registers".
pub trait HoldingRegisters {
    fn read_holding(&mut self, start: u16, count: u16) -> Result<Vec<u16>>;
}

/// Modbus RTU link to the inverter over a serial line.
/// The port is closed when the link is dropped.
pub struct RtuLink {
    ctx: Context,
}

impl RtuLink {
    pub fn open(conf: &SerialConfig) -> Result<Self> {
        info!(
            "🔌 opening {} ({} baud, unit id {})...",
            conf.port, conf.baud_rate, conf.unit_id
        );
        let builder = tokio_serial::new(&conf.port, conf.baud_rate)
            .data_bits(conf.data_bits)
            .parity(conf.parity)
            .stop_bits(conf.stop_bits)
            .timeout(conf.timeout);
        let mut ctx = rtu::connect_slave(&builder, Slave(conf.unit_id)).map_err(|e| {
            PollError::Connect {
                port: conf.port.clone(),
                source: e,
            }
        })?;
        ctx.set_timeout(Some(conf.timeout));
        info!("{}: connected successfully", conf.port);
        Ok(RtuLink { ctx })
    }
}

impl HoldingRegisters for RtuLink {
    fn read_holding(&mut self, start: u16, count: u16) -> Result<Vec<u16>> {
        match self.ctx.read_holding_registers(start, count) {
            Ok(Ok(words)) => Ok(words),
            Ok(Err(exception)) => Err(PollError::Read {
                address: start,
                count,
                reason: format!("exception response: {}", exception),
            }),
            Err(e) => Err(PollError::Read {
                address: start,
                count,
                reason: e.to_string(),
            }),
        }
    }
}

/// Performs single block reads with a bounded number of attempts and turns
/// every failure into "block unavailable".
pub struct BlockReader<T: HoldingRegisters> {
    link: T,
    attempts: u8,
    delay: Duration,
    last_read: Option<Instant>,
    pub blocks_ok: u32,
    pub blocks_failed: u32,
}

impl<T: HoldingRegisters> BlockReader<T> {
    pub fn new(link: T, attempts: u8, delay: Duration) -> Self {
        BlockReader {
            link,
            attempts: attempts.max(1),
            delay,
            last_read: None,
            blocks_ok: 0,
            blocks_failed: 0,
        }
    }

    #[cfg(test)]
    pub fn link(&self) -> &T {
        &self.link
    }

    /// Keeps consecutive requests at least `delay` apart (bus turnaround).
    fn pace(&mut self) {
        if let Some(last) = self.last_read {
            let elapsed = last.elapsed();
            if elapsed < self.delay {
                std::thread::sleep(self.delay - elapsed);
            }
        }
    }

    /// Reads `count` registers starting at `start`; `None` when the block is
    /// unavailable for this pass.
    pub fn read_block(&mut self, start: u16, count: u16) -> Option<RawRegisterBlock> {
        let count = count.min(MODBUS_MAX_BLOCK);
        for attempt in 1..=self.attempts {
            self.pace();
            let res = self.link.read_holding(start, count);
            self.last_read = Some(Instant::now());
            match res {
                Ok(words) if words.len() >= count as usize => {
                    debug!("-> 0x{:04X}+{} = {:04X?}", start, count, words);
                    self.blocks_ok += 1;
                    return Some(RawRegisterBlock {
                        start_address: start,
                        words: words[..count as usize].to_vec(),
                    });
                }
                Ok(words) => {
                    error!(
                        "short read (attempt #{} of {}) at 0x{:04X}: got {} of {} registers",
                        attempt,
                        self.attempts,
                        start,
                        words.len(),
                        count
                    );
                }
                Err(e) => {
                    error!("{} (attempt #{} of {})", e, attempt, self.attempts);
                }
            }
        }
        self.blocks_failed += 1;
        None
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeInverter;
    use super::*;

    #[test]
    fn one_transport_call_per_block() {
        let link = FakeInverter::with(&[(0x0580, 1205), (0x0581, 7)]);
        let mut reader = BlockReader::new(link, 2, Duration::ZERO);
        let block = reader.read_block(0x0580, 2).unwrap();
        assert_eq!(block.start_address, 0x0580);
        assert_eq!(block.words, vec![1205, 7]);
        assert_eq!(reader.link.calls, vec![(0x0580, 2)]);
        assert_eq!(reader.blocks_ok, 1);
    }

    #[test]
    fn failed_block_is_unavailable_not_fatal() {
        let mut link = FakeInverter::with(&[(0x0600, 1)]);
        link.broken.insert(0x0601);
        let mut reader = BlockReader::new(link, 2, Duration::ZERO);
        assert_eq!(reader.read_block(0x0600, 4), None);
        assert_eq!(reader.link.calls.len(), 2);
        assert_eq!(reader.blocks_failed, 1);
        assert!(reader.read_block(0x0610, 1).is_some());
    }

    #[test]
    fn retry_recovers_from_a_transient_error() {
        let mut link = FakeInverter::with(&[(0x0480, 0xFFFF)]);
        link.flaky_once.insert(0x0480);
        let mut reader = BlockReader::new(link, 2, Duration::ZERO);
        assert_eq!(reader.read_block(0x0480, 1).unwrap().words, vec![0xFFFF]);

        let mut link = FakeInverter::default();
        link.flaky_once.insert(0x0480);
        let mut single = BlockReader::new(link, 1, Duration::ZERO);
        assert_eq!(single.read_block(0x0480, 1), None);
    }

    #[test]
    fn request_size_is_clamped() {
        let mut reader = BlockReader::new(FakeInverter::default(), 1, Duration::ZERO);
        let block = reader.read_block(0, 300).unwrap();
        assert_eq!(block.words.len(), MODBUS_MAX_BLOCK as usize);
        assert_eq!(reader.link.calls, vec![(0, MODBUS_MAX_BLOCK)]);
    }

    #[test]
    fn consecutive_reads_are_paced() {
        let delay = Duration::from_millis(20);
        let mut reader = BlockReader::new(FakeInverter::default(), 1, delay);
        let started = Instant::now();
        reader.read_block(0, 1);
        reader.read_block(1, 1);
        reader.read_block(2, 1);
        assert!(started.elapsed() >= delay * 2);
    }
}
