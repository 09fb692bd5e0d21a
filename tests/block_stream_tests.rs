//! Binary stream tests: block layout, concurrent producers and the size limit.

use collector_io::memory::mapping::page_size;
use collector_io::packet::{
    fits, CommonHeader, PacketHeader, CLOSED_PACKET, COMMON_HEADER_SIZE, EMPTY_PACKET,
    PACKET_HEADER_SIZE,
};
use collector_io::prelude::*;
use collector_io::reader::{read_block_file, BlockFile};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn packet(kind: u32, payload: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0u8; 8 + payload.len()];
    unsafe { PacketHeader::new(kind, bytes.len() as u32).write_to(bytes.as_mut_ptr()) };
    bytes[8..].copy_from_slice(payload);
    bytes
}

/// How many `len`-byte packets one block takes before it is closed.
fn per_block(len: usize, block_size: usize) -> usize {
    let mut offset = 0;
    let mut n = 0;
    while fits(offset, len, block_size) {
        offset += len;
        n += 1;
    }
    n
}

#[test]
fn test_sequential_stream_layout() {
    let dir = tempfile::tempdir().unwrap();
    let engine = CaptureEngine::new(EngineConfig::new(dir.path())).unwrap();
    let bs = engine.config().block_size;
    let jclasses = engine.create_handle("jclasses").unwrap();
    assert_eq!(jclasses.discipline(), IoDiscipline::Sequential);
    assert_eq!(jclasses.lanes(), 1);

    for i in 0..4000u32 {
        let bytes = packet(RecordKind::Frame.as_u32(), &[(i % 251) as u8]);
        engine.write_packet(&jclasses, &bytes).unwrap();
    }
    engine.delete_handle(&jclasses).unwrap();

    let per_block = per_block(9, bs);
    let blocks = 4000usize.div_ceil(per_block);
    let file = BlockFile::open(dir.path().join("jclasses"), bs).unwrap();
    assert_eq!(file.len(), blocks * bs);
    if bs == 4096 {
        assert_eq!(per_block, 454);
        assert_eq!(blocks, 9);
    }

    let mut seen = 0u32;
    for index in 0..file.block_count() {
        let mut scanner = file.scan(index).unwrap();
        for p in scanner.by_ref() {
            let p = p.unwrap();
            assert_eq!(p.header.tsize, 9);
            assert_eq!(p.bytes[8], (seen % 251) as u8);
            seen += 1;
        }
        let trailer = scanner.trailer().unwrap();
        if index + 1 < blocks {
            assert_eq!(trailer.kind, CLOSED_PACKET);
            assert_eq!(trailer.tsize as usize, bs - per_block * 9);
        } else {
            let rest = 4000 - per_block * (blocks - 1);
            assert_eq!(trailer.kind, EMPTY_PACKET);
            assert_eq!(trailer.tsize as usize, bs - rest * 9);
        }
    }
    assert_eq!(seen, 4000);
}

#[test]
fn test_concurrent_lanes_round_trip() {
    const THREADS: usize = 4;
    const RECORDS: u32 = 3000;

    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(
        CaptureEngine::new(EngineConfig::new(dir.path()).with_lanes(THREADS).with_chunk_slots(2))
            .unwrap(),
    );
    let profile = engine.create_handle("profile").unwrap();

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let profile = Arc::clone(&profile);
            thread::spawn(move || {
                for i in 0..RECORDS {
                    let mut payload = [0u8; 5];
                    payload[0] = t as u8;
                    payload[1..].copy_from_slice(&i.to_ne_bytes());
                    profile
                        .write_record_on(t, RecordKind::Profile.as_u32(), &payload)
                        .unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(profile.stats().records, THREADS as u64 * RECORDS as u64);
    engine.delete_handle(&profile).unwrap();

    let bs = engine.config().block_size;
    let packets = read_block_file(dir.path().join("profile"), bs).unwrap();
    assert_eq!(packets.len(), THREADS * RECORDS as usize);

    let mut next = [0u32; THREADS];
    for bytes in &packets {
        let header = CommonHeader::read_from(bytes).unwrap();
        assert_eq!(header.packet.kind, RecordKind::Profile.as_u32());
        assert_eq!(header.packet.tsize as usize, COMMON_HEADER_SIZE + 5);
        let t = bytes[COMMON_HEADER_SIZE] as usize;
        assert_eq!(header.lane_id as usize, t);
        assert_ne!(header.thread_id, 0);
        let i = u32::from_ne_bytes(bytes[COMMON_HEADER_SIZE + 1..].try_into().unwrap());
        // A lane with a single writer keeps its records in order.
        assert_eq!(i, next[t]);
        next[t] += 1;
    }
    assert!(next.iter().all(|&n| n == RECORDS));
}

#[test]
fn test_busy_lane_is_overloaded() {
    let dir = tempfile::tempdir().unwrap();
    let engine =
        CaptureEngine::new(EngineConfig::new(dir.path()).with_lanes(1).with_chunk_slots(1)).unwrap();
    let heap = engine.create_handle("heaptrace").unwrap();
    let table = heap.block_engine().unwrap().table();

    let claim = table.claim(0).unwrap();
    assert!(claim.fresh);
    assert!(matches!(
        heap.write_record(RecordKind::Heap.as_u32(), &[1, 2]),
        Err(Error::Overloaded { lane: 0 })
    ));
    assert_eq!(heap.stats().overloads, 1);
    assert_eq!(heap.stats().dropped, 1);

    table.release(0, claim.slot);
    heap.write_record(RecordKind::Heap.as_u32(), &[1, 2]).unwrap();
    assert_eq!(heap.stats().records, 1);
}

#[test]
fn test_drain_times_out_on_held_slot() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::new(dir.path())
        .with_lanes(1)
        .with_chunk_slots(1)
        .with_retry(RetryPolicy::spin(Duration::from_millis(20)));
    let engine = CaptureEngine::new(config).unwrap();
    let sync = engine.create_handle("synctrace").unwrap();
    let table = sync.block_engine().unwrap().table();
    let _held = table.claim(0).unwrap();

    assert!(matches!(
        engine.delete_handle(&sync),
        Err(Error::Timeout(_))
    ));
    assert!(sync.is_deleted());
    assert!(engine.registry().is_empty());
    // A second delete finds nothing left to do.
    engine.delete_handle(&sync).unwrap();
}

#[test]
fn test_malformed_packets_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let engine = CaptureEngine::new(EngineConfig::new(dir.path()).with_lanes(1)).unwrap();
    let frames = engine.create_handle("frameinfo").unwrap();
    let bs = engine.config().block_size;

    let mut lying = packet(RecordKind::Frame.as_u32(), &[0; 4]);
    lying[0] = 100;
    assert!(matches!(
        engine.write_packet(&frames, &lying),
        Err(Error::MalformedPacket(_))
    ));
    assert!(matches!(
        engine.write_packet(&frames, &packet(CLOSED_PACKET, &[0; 4])),
        Err(Error::MalformedPacket(_))
    ));
    assert!(matches!(
        engine.write_record(&frames, EMPTY_PACKET, &[0; 4]),
        Err(Error::MalformedPacket(_))
    ));
    assert!(matches!(
        engine.write_packet(&frames, &packet(RecordKind::Frame.as_u32(), &vec![0; bs])),
        Err(Error::TooLarge { .. })
    ));

    // A packet exactly one block long is accepted.
    engine
        .write_packet(&frames, &packet(RecordKind::Frame.as_u32(), &vec![7; bs - 8]))
        .unwrap();
    assert_eq!(frames.stats().records, 1);
    assert_eq!(frames.stats().dropped, 4);
}

#[test]
fn test_packets_that_leave_no_room_for_padding() {
    for (name, lanes) in [("jclasses", 1), ("profile", 2)] {
        let dir = tempfile::tempdir().unwrap();
        let engine = CaptureEngine::new(EngineConfig::new(dir.path()).with_lanes(lanes)).unwrap();
        let handle = engine.create_handle(name).unwrap();
        assert_eq!(handle.lanes(), lanes);
        let bs = engine.config().block_size;
        let kind = RecordKind::Profile.as_u32();

        let small = packet(kind, &[3; 8]);
        handle.write_packet_on(lanes - 1, &small).unwrap();

        // Too long to be followed by an EMPTY header, too short to end the block.
        for len in [bs - 1, bs - 4, bs - PACKET_HEADER_SIZE + 1] {
            assert!(
                matches!(
                    handle.write_packet_on(0, &packet(kind, &vec![5; len - 8])),
                    Err(Error::TooLarge { .. })
                ),
                "{name}: {len}-byte packet accepted"
            );
        }

        let padded = packet(kind, &vec![6; bs - 16]);
        let whole = packet(kind, &vec![7; bs - 8]);
        handle.write_packet_on(0, &padded).unwrap();
        handle.write_packet_on(0, &whole).unwrap();
        assert_eq!(handle.stats().records, 3);
        assert_eq!(handle.stats().dropped, 3);
        engine.delete_handle(&handle).unwrap();

        // The neighbouring lane's packet survives intact.
        let packets = read_block_file(dir.path().join(name), bs).unwrap();
        assert_eq!(packets, vec![small, padded, whole], "{name}");
    }
}

#[derive(Default)]
struct CountingControl {
    terminations: AtomicUsize,
}

impl ExperimentControl for CountingControl {
    fn terminate(&self, reason: TerminateReason) {
        assert_eq!(reason, TerminateReason::SizeLimit { limit_blocks: 4 });
        self.terminations.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_size_limit_trips_once() {
    const THREADS: usize = 4;

    let dir = tempfile::tempdir().unwrap();
    let control = Arc::new(CountingControl::default());
    let engine = Arc::new(
        CaptureEngine::with_control(
            EngineConfig::new(dir.path()).with_lanes(THREADS),
            control.clone(),
        )
        .unwrap(),
    );
    engine.governor().set_limit_blocks(4);
    let profile = engine.create_handle("profile").unwrap();

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let profile = Arc::clone(&profile);
            thread::spawn(move || loop {
                match profile.write_record_on(t, RecordKind::Profile.as_u32(), &[0; 64]) {
                    Ok(()) => {}
                    Err(Error::SizeLimitExceeded) | Err(Error::Paused) => break,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(control.terminations.load(Ordering::SeqCst), 1);
    assert_eq!(engine.governor().trips(), 1);
    assert!(engine.is_paused());
    assert!(!engine.resume());
    // The limit stops mapping, it does not deactivate the handle.
    assert!(profile.is_active());

    engine.delete_handle(&profile).unwrap();
    let bs = engine.config().block_size;
    let len = std::fs::metadata(dir.path().join("profile")).unwrap().len();
    assert_eq!(len, 4 * bs as u64);
}

#[test]
fn test_block_size_above_page_size() {
    let dir = tempfile::tempdir().unwrap();
    let bs = page_size() * 4;
    let config = EngineConfig::new(dir.path())
        .with_block_size(bs)
        .with_text_buffers(bs, 4)
        .with_lanes(2);
    let engine = CaptureEngine::new(config).unwrap();
    let omp = engine.create_handle("omptrace").unwrap();
    for i in 0..1000u32 {
        engine
            .write_record(&omp, RecordKind::Omp.as_u32(), &i.to_ne_bytes())
            .unwrap();
    }
    engine.delete_handle(&omp).unwrap();
    let packets = read_block_file(dir.path().join("omptrace"), bs).unwrap();
    assert_eq!(packets.len(), 1000);
}
