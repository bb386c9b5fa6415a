//! Integration tests for the packet-to-pixel pipeline.
//!
//! ```text
//! Packets → Synchronizer → FrameAssembler → FrameQueue → AGC → Colormap
//! ```
//!
//! Packets come from `PacketGenerator` through `ReplayTransport`, so no sensor is
//! needed.

use vospi_scope_lib::agc::AgcNormalizer;
use vospi_scope_lib::colormap::{colorize, Palette};
use vospi_scope_lib::config::{AgcConfig, SyncConfig};
use vospi_scope_lib::frame_assembler::{Frame, FrameAssembler, FrameError};
use vospi_scope_lib::frame_buffer::{FrameQueue, OverflowPolicy};
use vospi_scope_lib::packet::FrameGeometry;
use vospi_scope_lib::replay::ReplayTransport;
use vospi_scope_lib::sink::RenderedFrame;
use vospi_scope_lib::test_utils::PacketGenerator;
use vospi_scope_lib::transport::TransportError;

fn assembler() -> FrameAssembler {
    FrameAssembler::new(FrameGeometry::LEPTON, SyncConfig::default())
}

/// Three discards, then lines 0..60 with `row * 80 + col` samples
fn reference_sequence(gen: &PacketGenerator) -> Vec<Vec<u8>> {
    let mut packets = gen.discards(3);
    packets.extend(gen.frame_packets(|row, col| (row * 80 + col) as u16));
    packets
}

fn flat_frame(width: usize, samples: Vec<u16>) -> Frame {
    let height = samples.len() / width;
    Frame::from_samples(FrameGeometry::new(width, height), samples).unwrap()
}

// ============================================================================
// Assembly
// ============================================================================

#[test]
fn test_reference_sequence_yields_one_frame() {
    let gen = PacketGenerator::default();
    let mut transport = ReplayTransport::new(reference_sequence(&gen));
    let mut assembler = assembler();

    let frame = assembler.read_frame(&mut transport).unwrap();
    assert_eq!(frame[0][0], 0);
    assert_eq!(frame[0][79], 79);
    assert_eq!(frame[30][5], 2405);
    assert_eq!(frame[59][79], 4799);

    // Nothing left to build a second frame from
    let second = assembler.read_frame(&mut transport);
    assert!(matches!(
        second,
        Err(FrameError::Transport(TransportError::Exhausted))
    ));
    assert_eq!(assembler.frames_completed(), 1);
}

#[test]
fn test_every_row_matches_its_line() {
    let gen = PacketGenerator::default();
    let mut transport = ReplayTransport::new(reference_sequence(&gen));

    let frame = assembler().read_frame(&mut transport).unwrap();
    for row in 0..60 {
        let expected: Vec<u16> = (0..80).map(|col| (row * 80 + col) as u16).collect();
        assert_eq!(frame.row(row), expected.as_slice(), "row {}", row);
    }
}

#[test]
fn test_discard_mid_frame_loses_sync_and_enqueues_nothing() {
    let gen = PacketGenerator::default();
    let mut packets = reference_sequence(&gen);
    // Index 3 is line 0
    packets[3 + 30] = gen.discard();

    let mut transport = ReplayTransport::new(packets);
    let mut assembler = assembler();
    let queue = FrameQueue::new(3, OverflowPolicy::DropOldest);

    match assembler.read_frame(&mut transport) {
        Ok(frame) => {
            queue.try_enqueue(frame);
            panic!("torn frame returned");
        }
        Err(e) => {
            assert!(matches!(e, FrameError::LostSync { line: 30 }), "{:?}", e);
            assert!(e.requires_resync());
        }
    }

    assert!(queue.is_empty());
    assert_eq!(queue.enqueued(), 0);
    assert_eq!(assembler.frames_aborted(), 1);
}

#[test]
fn test_recovers_on_next_clean_frame() {
    let gen = PacketGenerator::default();
    let mut packets = reference_sequence(&gen);
    packets[3 + 10] = gen.discard();
    packets.extend(gen.discards(5));
    packets.extend(gen.solid_frame(1234));

    let mut transport = ReplayTransport::new(packets);
    let mut assembler = assembler();

    assert!(matches!(
        assembler.read_frame(&mut transport),
        Err(FrameError::LostSync { line: 10 })
    ));
    let frame = assembler.read_frame(&mut transport).unwrap();
    assert!(frame.samples().iter().all(|&v| v == 1234));
}

#[test]
fn test_skipped_line_is_out_of_order() {
    let gen = PacketGenerator::default();
    let mut packets = gen.gradient_frame();
    packets.remove(7);

    let mut transport = ReplayTransport::new(packets);
    let result = assembler().read_frame(&mut transport);

    assert!(matches!(
        result,
        Err(FrameError::OutOfOrder {
            expected: 7,
            found: Some(8)
        })
    ));
}

// ============================================================================
// Queue hand-off
// ============================================================================

#[test]
fn test_queue_never_exceeds_capacity() {
    let gen = PacketGenerator::default();
    let mut transport = ReplayTransport::new(gen.stream(6, 2));
    let mut assembler = assembler();
    let queue = FrameQueue::new(2, OverflowPolicy::DropOldest);

    while let Ok(frame) = assembler.read_frame(&mut transport) {
        queue.try_enqueue(frame);
        assert!(queue.len() <= 2);
    }

    assert_eq!(queue.len(), 2);
    assert_eq!(queue.dropped(), 4);
    // Drop-oldest keeps the two most recent frames
    let first = queue.try_dequeue().unwrap();
    let second = queue.try_dequeue().unwrap();
    assert!(first.sequence() < second.sequence());
    assert_eq!(second.sequence(), assembler.frames_completed());
}

#[test]
fn test_drop_newest_keeps_first_frames() {
    let queue = FrameQueue::new(2, OverflowPolicy::DropNewest);
    for value in [1u16, 2, 3] {
        queue.try_enqueue(flat_frame(2, vec![value; 4]));
    }

    assert_eq!(queue.len(), 2);
    assert_eq!(queue.try_dequeue().unwrap().samples()[0], 1);
    assert_eq!(queue.try_dequeue().unwrap().samples()[0], 2);
    assert!(queue.try_dequeue().is_none());
}

// ============================================================================
// AGC and colormap
// ============================================================================

#[test]
fn test_agc_bounds_move_strictly_toward_new_extrema() {
    let mut agc = AgcNormalizer::new(&AgcConfig {
        initial_min: 1000,
        initial_max: 9000,
        min_range: 100,
    });

    agc.update(&flat_frame(2, vec![3000, 5000]));
    let (min1, max1) = agc.bounds();
    assert!(1000 < min1 && min1 < 3000, "min1 = {}", min1);
    assert!(5000 < max1 && max1 < 9000, "max1 = {}", max1);

    agc.update(&flat_frame(2, vec![4000, 4500]));
    let (min2, max2) = agc.bounds();
    assert!(min1 < min2 && min2 < 4000, "min2 = {}", min2);
    assert!(4500 < max2 && max2 < max1, "max2 = {}", max2);
}

#[test]
fn test_agc_enforces_range_floor() {
    let mut agc = AgcNormalizer::new(&AgcConfig {
        initial_min: 5000,
        initial_max: 5010,
        min_range: 100,
    });

    agc.update(&flat_frame(2, vec![5000, 5004]));

    let (min, max) = agc.bounds();
    assert_eq!(max, min + 100);
}

#[test]
fn test_colorize_is_pure() {
    assert_eq!(Palette::ALL.len(), 3);
    for palette in Palette::ALL {
        for index in 0..=255u8 {
            assert_eq!(colorize(index, palette), colorize(index, palette));
        }
    }
    assert_ne!(colorize(128, Palette::Iron), colorize(128, Palette::Rainbow));
}

#[test]
fn test_frame_to_pixels() {
    let gen = PacketGenerator::default();
    let mut transport = ReplayTransport::new(gen.stream(1, 0));
    let frame = assembler().read_frame(&mut transport).unwrap();

    let mut agc = AgcNormalizer::default();
    let normalized = agc.update_and_map(&frame);
    let rendered = RenderedFrame::render(&normalized, Palette::Grayscale, frame.sequence());

    assert_eq!(rendered.width, 80);
    assert_eq!(rendered.height, 60);
    assert_eq!(rendered.pixels.len(), 4800);
    assert_eq!(rendered.to_rgb_bytes().len(), 4800 * 3);

    // Grayscale keeps channels equal and brightness monotonic along a row
    let left = rendered.pixel(59, 0).unwrap();
    let right = rendered.pixel(59, 79).unwrap();
    assert_eq!(left.r, left.g);
    assert_eq!(left.g, left.b);
    assert!(left.r <= right.r);
}
