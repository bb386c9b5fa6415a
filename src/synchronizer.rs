//! Packet-level synchronization for the VoSPI stream
//!
//! The sensor never acknowledges anything, so lock is inferred purely from packet
//! content: discard packets pad the gaps between frames and a `Line(0)` packet marks
//! the start of a frame. [`Synchronizer::locate_start`] is the only way into a
//! synchronized capture.
//!
//! ```text
//!            Line(0) observed
//! UNSYNCED ───────────────────▶ SYNCED
//!     ▲                            │
//!     └────────────────────────────┘
//!   discard / out-of-order mid-frame,
//!   link idle, transport failure
//! ```

use std::time::Duration;

use thiserror::Error;

use crate::config::SyncConfig;
use crate::packet::{classify, crc_matches, FrameGeometry, PacketKind};
use crate::transport::{PacketTransport, TransportError};

/// Errors raised while locating the start of a frame
#[derive(Error, Debug)]
pub enum SyncError {
    /// Too many consecutive discard packets; the bus must idle before retrying
    #[error("link idle: {discards} consecutive discard packets")]
    LinkIdle {
        /// Length of the discard run that tripped the ceiling
        discards: u32,
    },

    /// Packets kept arriving but none of them started a frame
    #[error("no frame start within {packets} packets")]
    NoFrameStart {
        /// Packets examined before giving up
        packets: u32,
    },

    /// The transport failed outright
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Lock state of the synchronizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// The next expected line number is unknown
    #[default]
    Unsynced,
    /// The host's expected line matches the sensor's output
    Synced,
}

/// Tracks lock state over the packet stream and owns the packet scratch buffer
#[derive(Debug)]
pub struct Synchronizer {
    geometry: FrameGeometry,
    config: SyncConfig,
    state: SyncState,
    /// Current run of consecutive discard packets
    discard_run: u32,
    /// Failed frame attempts since the last good frame or backoff
    resync_attempts: u32,
    /// Number of UNSYNCED -> SYNCED transitions
    lock_count: u64,
    /// Receive buffer for the most recent transfer
    packet: Vec<u8>,
}

impl Synchronizer {
    /// Create an unsynchronized synchronizer for the given geometry
    pub fn new(geometry: FrameGeometry, config: SyncConfig) -> Self {
        Self {
            geometry,
            config,
            state: SyncState::Unsynced,
            discard_run: 0,
            resync_attempts: 0,
            lock_count: 0,
            packet: vec![0u8; geometry.packet_size()],
        }
    }

    /// Current lock state
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Whether the synchronizer currently holds lock
    pub fn is_synced(&self) -> bool {
        self.state == SyncState::Synced
    }

    /// Length of the current discard run
    pub fn discard_run(&self) -> u32 {
        self.discard_run
    }

    /// Failed frame attempts since the last good frame or backoff
    pub fn resync_attempts(&self) -> u32 {
        self.resync_attempts
    }

    /// Number of times lock has been acquired
    pub fn lock_count(&self) -> u64 {
        self.lock_count
    }

    /// Frame geometry packets are classified against
    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    /// Bytes of the most recently received packet
    pub fn packet(&self) -> &[u8] {
        &self.packet
    }

    /// Classify a packet against this synchronizer's frame height
    pub fn classify(&self, data: &[u8]) -> PacketKind {
        classify(data, self.geometry.height)
    }

    /// Whether the current packet passes the CRC check (always true when disabled)
    pub fn crc_ok(&self) -> bool {
        !self.config.verify_crc || crc_matches(&self.packet)
    }

    /// Perform one transfer into the scratch buffer and classify it
    ///
    /// # Errors
    ///
    /// Returns the transport's error; lock is dropped since the stream position is lost.
    pub fn read_packet<T>(&mut self, transport: &mut T) -> Result<PacketKind, TransportError>
    where
        T: PacketTransport + ?Sized,
    {
        if let Err(e) = transport.transfer(&mut self.packet) {
            self.state = SyncState::Unsynced;
            return Err(e);
        }
        Ok(classify(&self.packet, self.geometry.height))
    }

    /// Read packets until a `Line(0)` packet marks the start of a frame
    ///
    /// Discard and invalid packets are skipped, as are lines of a frame already in
    /// progress. On success the line-0 packet is left in [`Self::packet`].
    ///
    /// # Errors
    ///
    /// - `SyncError::LinkIdle` when the discard run exceeds the configured ceiling
    /// - `SyncError::NoFrameStart` when the packet budget runs out without a line 0
    /// - `SyncError::Transport` when the bus fails
    pub fn locate_start<T>(&mut self, transport: &mut T) -> Result<(), SyncError>
    where
        T: PacketTransport + ?Sized,
    {
        let budget = self.packet_budget();
        let mut examined = 0u32;
        self.discard_run = 0;

        loop {
            if examined >= budget {
                self.state = SyncState::Unsynced;
                return Err(SyncError::NoFrameStart { packets: examined });
            }
            examined += 1;

            match self.read_packet(transport)? {
                PacketKind::Discard => {
                    self.discard_run += 1;
                    if self.discard_run > self.config.max_discards {
                        let discards = self.discard_run;
                        self.discard_run = 0;
                        self.state = SyncState::Unsynced;
                        return Err(SyncError::LinkIdle { discards });
                    }
                }
                PacketKind::Line(0) if self.crc_ok() => {
                    self.discard_run = 0;
                    if self.state == SyncState::Unsynced {
                        self.state = SyncState::Synced;
                        self.lock_count += 1;
                        log::info!(
                            "Sync acquired after {} packets (lock #{})",
                            examined,
                            self.lock_count
                        );
                    }
                    return Ok(());
                }
                PacketKind::Line(line) => {
                    // Mid-frame or corrupt: keep scanning for the next frame boundary
                    self.discard_run = 0;
                    log::trace!("Skipping line {} while locating frame start", line);
                }
                PacketKind::Invalid => {
                    self.discard_run = 0;
                }
            }
        }
    }

    /// Drop lock after a mid-frame protocol violation
    pub fn lose_sync(&mut self) {
        if self.state == SyncState::Synced {
            log::debug!("Sync lost");
        }
        self.state = SyncState::Unsynced;
    }

    /// Record a completed frame; clears the resync attempt counter
    pub fn record_success(&mut self) {
        self.resync_attempts = 0;
    }

    /// Record a failed frame attempt
    ///
    /// Returns `true` once the failures exceed the resync threshold, meaning the
    /// caller must idle the bus (see [`Self::begin_backoff`]) before retrying.
    pub fn record_failure(&mut self) -> bool {
        self.resync_attempts += 1;
        self.resync_attempts > self.config.resync_threshold
    }

    /// Enter the idle-backoff: drop lock, clear counters and return how long the
    /// bus must stay idle before the sensor will resynchronize
    pub fn begin_backoff(&mut self) -> Duration {
        self.resync_attempts = 0;
        self.discard_run = 0;
        self.state = SyncState::Unsynced;
        self.config.backoff()
    }

    /// Packets examined per `locate_start` before giving up
    ///
    /// Covers a full discard run plus one whole frame of lines to skip.
    fn packet_budget(&self) -> u32 {
        let height = u32::try_from(self.geometry.height).unwrap_or(u32::MAX);
        self.config
            .max_discards
            .saturating_add(height)
            .saturating_mul(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::ReplayTransport;
    use crate::test_utils::PacketGenerator;

    fn synchronizer() -> Synchronizer {
        Synchronizer::new(FrameGeometry::LEPTON, SyncConfig::default())
    }

    #[test]
    fn test_starts_unsynced() {
        let sync = synchronizer();
        assert_eq!(sync.state(), SyncState::Unsynced);
        assert_eq!(sync.discard_run(), 0);
        assert_eq!(sync.resync_attempts(), 0);
        assert_eq!(sync.packet().len(), 164);
    }

    #[test]
    fn test_locate_start_skips_discards() {
        let gen = PacketGenerator::default();
        let mut packets = gen.discards(3);
        packets.push(gen.line_packet(0, &[0u16; 80]));
        let mut transport = ReplayTransport::new(packets);

        let mut sync = synchronizer();
        sync.locate_start(&mut transport).unwrap();

        assert!(sync.is_synced());
        assert_eq!(sync.lock_count(), 1);
        assert_eq!(sync.classify(sync.packet()), PacketKind::Line(0));
        assert_eq!(transport.remaining(), 0);
    }

    #[test]
    fn test_locate_start_skips_partial_frame() {
        let gen = PacketGenerator::default();
        let mut packets = Vec::new();
        for line in 40..60u16 {
            packets.push(gen.line_packet(line, &[0u16; 80]));
        }
        packets.push(gen.invalid_packet(0x0100));
        packets.push(gen.line_packet(0, &[7u16; 80]));
        let mut transport = ReplayTransport::new(packets);

        let mut sync = synchronizer();
        sync.locate_start(&mut transport).unwrap();

        assert!(sync.is_synced());
        assert_eq!(transport.remaining(), 0);
    }

    #[test]
    fn test_locate_start_link_idle_after_ceiling() {
        let gen = PacketGenerator::default();
        let config = SyncConfig {
            max_discards: 10,
            ..Default::default()
        };
        let mut transport = ReplayTransport::new(gen.discards(50));
        let mut sync = Synchronizer::new(FrameGeometry::LEPTON, config);

        let result = sync.locate_start(&mut transport);

        assert!(matches!(result, Err(SyncError::LinkIdle { discards: 11 })));
        assert!(!sync.is_synced());
        assert_eq!(transport.remaining(), 39, "stops reading at the ceiling");
    }

    #[test]
    fn test_discard_run_resets_on_line_packet() {
        let gen = PacketGenerator::default();
        let config = SyncConfig {
            max_discards: 5,
            ..Default::default()
        };
        let mut packets = gen.discards(5);
        packets.push(gen.line_packet(12, &[0u16; 80]));
        packets.extend(gen.discards(5));
        packets.push(gen.line_packet(0, &[0u16; 80]));
        let mut transport = ReplayTransport::new(packets);
        let mut sync = Synchronizer::new(FrameGeometry::LEPTON, config);

        assert!(sync.locate_start(&mut transport).is_ok());
    }

    #[test]
    fn test_locate_start_gives_up_without_frame_start() {
        let gen = PacketGenerator::default();
        let packets: Vec<_> = (0..2000).map(|_| gen.line_packet(5, &[0u16; 80])).collect();
        let mut transport = ReplayTransport::new(packets);
        let mut sync = synchronizer();

        let result = sync.locate_start(&mut transport);

        assert!(matches!(result, Err(SyncError::NoFrameStart { .. })));
    }

    #[test]
    fn test_locate_start_propagates_transport_error() {
        let mut transport = ReplayTransport::new(Vec::new());
        let mut sync = synchronizer();

        let result = sync.locate_start(&mut transport);

        assert!(matches!(
            result,
            Err(SyncError::Transport(TransportError::Exhausted))
        ));
    }

    #[test]
    fn test_crc_rejects_corrupt_frame_start() {
        let gen = PacketGenerator::default();
        let mut corrupt = gen.line_packet(0, &[1u16; 80]);
        corrupt[50] ^= 0xFF;
        let packets = vec![corrupt, gen.line_packet(0, &[2u16; 80])];
        let mut transport = ReplayTransport::new(packets);
        let config = SyncConfig {
            verify_crc: true,
            ..Default::default()
        };
        let mut sync = Synchronizer::new(FrameGeometry::LEPTON, config);

        sync.locate_start(&mut transport).unwrap();

        assert_eq!(transport.remaining(), 0, "corrupt line 0 must be skipped");
        assert!(sync.crc_ok());
    }

    #[test]
    fn test_lose_sync() {
        let gen = PacketGenerator::default();
        let mut transport = ReplayTransport::new(vec![gen.line_packet(0, &[0u16; 80])]);
        let mut sync = synchronizer();
        sync.locate_start(&mut transport).unwrap();

        sync.lose_sync();

        assert_eq!(sync.state(), SyncState::Unsynced);
    }

    #[test]
    fn test_backoff_after_threshold() {
        let mut sync = synchronizer();
        for _ in 0..5 {
            assert!(!sync.record_failure());
        }
        assert!(sync.record_failure(), "sixth failure requires backoff");

        assert_eq!(sync.begin_backoff(), Duration::from_millis(185));
        assert_eq!(sync.resync_attempts(), 0);
        assert_eq!(sync.state(), SyncState::Unsynced);
    }

    #[test]
    fn test_success_clears_attempts() {
        let mut sync = synchronizer();
        sync.record_failure();
        sync.record_failure();
        sync.record_success();
        assert_eq!(sync.resync_attempts(), 0);
    }
}
