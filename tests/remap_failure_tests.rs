//! Failed file mappings. Kept in its own test binary: it lowers the process
//! file size limit.

use collector_io::prelude::*;
use collector_io::reader::read_block_file;
use collector_io::stream::BlockState;
use rustix::io::Errno;

mod common;
use common::CapturedOutput;

/// Cap the size of files this process may write, returning the old limit.
///
/// `SIGXFSZ` is ignored so that writes past the cap fail with `EFBIG`.
fn limit_file_size(bytes: u64) -> libc::rlimit {
    let mut previous = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: plain system calls on valid pointers.
    unsafe {
        libc::signal(libc::SIGXFSZ, libc::SIG_IGN);
        assert_eq!(libc::getrlimit(libc::RLIMIT_FSIZE, &mut previous), 0);
        let lowered = libc::rlimit {
            rlim_cur: bytes as libc::rlim_t,
            rlim_max: previous.rlim_max,
        };
        assert_eq!(libc::setrlimit(libc::RLIMIT_FSIZE, &lowered), 0);
    }
    previous
}

fn restore_file_size(previous: libc::rlimit) {
    // SAFETY: as above.
    unsafe { assert_eq!(libc::setrlimit(libc::RLIMIT_FSIZE, &previous), 0) };
}

#[test]
fn test_failed_remap_deactivates_handle() {
    let dir = tempfile::tempdir().unwrap();
    let output = CapturedOutput::default();

    output.capture(|| {
        let config = EngineConfig::new(dir.path()).with_lanes(2);
        let bs = config.block_size;
        let engine = CaptureEngine::new(config.with_text_buffers(bs, 4)).unwrap();
        let profile = engine.create_handle("profile").unwrap();
        let log = engine.create_handle("log.xml").unwrap();

        // Two blocks per file; mapping a third one fails.
        let previous = limit_file_size(2 * bs as u64);

        let mut records = 0u64;
        let failure = loop {
            match profile.write_record_on(0, RecordKind::Profile.as_u32(), &[4; 100]) {
                Ok(()) => records += 1,
                Err(e) => break e,
            }
            assert!(records < 10_000, "file size limit never hit");
        };
        assert!(matches!(failure, Error::System(Errno::FBIG)), "{failure}");

        let chunk = [b'x'; 100];
        let mut text_bytes = 0u64;
        let failure = loop {
            match log.write_string(&chunk) {
                Ok(()) => text_bytes += chunk.len() as u64,
                Err(e) => break e,
            }
            assert!(text_bytes < 10_000_000, "file size limit never hit");
        };
        assert!(matches!(failure, Error::System(Errno::FBIG)), "{failure}");

        // A text stream whose first window cannot be mapped is never registered.
        limit_file_size(bs as u64 / 2);
        assert!(matches!(
            engine.create_handle("map.xml"),
            Err(Error::System(Errno::FBIG))
        ));
        assert_eq!(engine.registry().len(), 2);

        restore_file_size(previous);

        // The whole handle is off, not just the lane that failed.
        assert!(!profile.is_active());
        assert!(matches!(
            profile.write_record_on(1, RecordKind::Profile.as_u32(), &[4; 100]),
            Err(Error::Inactive)
        ));
        assert_eq!(profile.stats().dropped, 1);
        // The failing writer detached its block on the way out.
        let table = profile.block_engine().unwrap().table();
        assert_eq!(table.state(0, 0), BlockState::Drained);

        assert!(!log.is_active());
        assert!(matches!(log.write_string(b"late"), Err(Error::Inactive)));
        assert_eq!(log.stats().dropped, 1);

        engine.delete_handle(&profile).unwrap();
        engine.delete_handle(&log).unwrap();

        // Everything acknowledged before the failure is in the files.
        let packets = read_block_file(dir.path().join("profile"), bs).unwrap();
        assert_eq!(packets.len() as u64, records);
        let text = std::fs::read(dir.path().join("log.xml")).unwrap();
        assert_eq!(text.len() as u64, text_bytes);
        assert!(text.iter().all(|&b| b == b'x'));
    });

    // Each handle reports its deactivation once.
    let lines = output.lines();
    let deactivated: Vec<_> = lines
        .iter()
        .filter(|l| l.contains("data handle deactivated"))
        .collect();
    assert!(deactivated.iter().all(|l| l.contains("code=3")));
    for stream in ["stream=profile", "stream=log.xml", "stream=map.xml"] {
        let reports = deactivated.iter().filter(|l| l.contains(stream)).count();
        assert_eq!(reports, 1, "{stream}: {deactivated:?}");
    }
    assert!(lines
        .iter()
        .any(|l| l.contains("cannot create data handle") && l.contains("stream=map.xml")));
}
