#[cfg(test)]
mod store_tests {
    use std::fs::{self, OpenOptions};
    use std::io::{Seek, SeekFrom, Write};
    use std::path::Path;
    use std::thread::sleep;
    use std::time::Duration;

    use tempfile::tempdir;

    use crate::persistence::file_store::{AppendLog, append_record};
    use crate::persistence::record::{FILE_HEADER_SIZE, RECORD_HEADER_SIZE};
    use crate::persistence::{
        CompactionPolicy, MessageStore, RecoveryPolicy, StoreConfig, validate_destination_name,
    };
    use crate::utils::error::StoreError;

    /// Config whose ratio trigger never fires, so tests decide when to compact.
    fn manual_compaction(dir: &Path) -> StoreConfig {
        let mut config = StoreConfig::new(dir);
        config.compaction = CompactionPolicy {
            active_ratio: 0.0,
            rewrite_interval: Duration::ZERO,
            max_file_bytes: None,
        };
        config
    }

    fn record_size(body: &str) -> u64 {
        RECORD_HEADER_SIZE + body.len() as u64
    }

    #[test]
    fn test_deferred_ack() {
        let dir = tempdir().unwrap();
        let mut q = MessageStore::open("test", manual_compaction(dir.path())).unwrap();

        let id = q.send(b"0123456789").unwrap();
        let msg = q.receive(false).unwrap().unwrap();

        assert_eq!(msg.id, id);
        assert_eq!(&msg.body[..], b"0123456789");
        assert!(msg.headers.is_empty());
        assert!(q.is_in_use(&id));
        assert_eq!(q.pending_count(), 0);
        assert_eq!(q.in_use_count(), 1);
    }

    #[test]
    fn test_single_message_auto_ack() {
        let dir = tempdir().unwrap();
        let mut q = MessageStore::open("test", manual_compaction(dir.path())).unwrap();

        let id = q.send(b"abcabcabc").unwrap();
        let msg = q.receive(true).unwrap().unwrap();

        assert_eq!(msg.id, id);
        assert_eq!(&msg.body[..], b"abcabcabc");
        assert!(!q.is_in_use(&id));
        assert!(q.receive(true).unwrap().is_none());
    }

    #[test]
    fn test_headers_are_stored_separately() {
        let dir = tempdir().unwrap();
        let mut q = MessageStore::open("test", manual_compaction(dir.path())).unwrap();

        q.send_with_headers(b"content-type:text/plain", b"body").unwrap();
        let msg = q.receive(true).unwrap().unwrap();
        assert_eq!(&msg.headers[..], b"content-type:text/plain");
        assert_eq!(&msg.body[..], b"body");
    }

    #[test]
    fn test_reload_state() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::new(dir.path());
        {
            let mut q = MessageStore::open("test", config.clone()).unwrap();
            q.send(b"abcd").unwrap();
            q.send(b"1234").unwrap();
        }

        let mut q2 = MessageStore::open("test", config.clone()).unwrap();
        assert_eq!(q2.pending_count(), 2);
        assert_eq!(q2.in_use_count(), 0);
        let expected_len = FILE_HEADER_SIZE + record_size("abcd") + record_size("1234");
        assert_eq!(q2.file_len().unwrap(), expected_len);

        q2.receive(true).unwrap().unwrap();
        assert_eq!(q2.pending_count(), 1);
        assert_eq!(q2.in_use_count(), 0);
        assert_eq!(q2.file_len().unwrap(), expected_len);

        let msg = q2.receive(false).unwrap().unwrap();
        assert_eq!(&msg.body[..], b"1234");
        assert_eq!(q2.pending_count(), 0);
        assert_eq!(q2.in_use_count(), 1);
        assert_eq!(q2.file_len().unwrap(), expected_len);

        // Nothing left active: the ack drops the ratio to zero and compacts.
        assert!(q2.ack(&msg.id).unwrap());
        assert_eq!(q2.in_use_count(), 0);
        assert_eq!(q2.file_len().unwrap(), FILE_HEADER_SIZE);
        drop(q2);

        let q3 = MessageStore::open("test", config).unwrap();
        assert_eq!(q3.pending_count(), 0);
        assert_eq!(q3.in_use_count(), 0);
    }

    #[test]
    fn test_durability_round_trip() {
        let dir = tempdir().unwrap();
        let config = manual_compaction(dir.path());
        {
            let mut q = MessageStore::open("/queue/durable", config.clone()).unwrap();
            for i in 0..25 {
                q.send(format!("msg-{i}").as_bytes()).unwrap();
            }
        }

        let mut q = MessageStore::open("/queue/durable", config).unwrap();
        assert_eq!(q.pending_count(), 25);
        assert_eq!(q.in_use_count(), 0);
        assert_eq!(q.total_count(), 25);
        let first = q.receive(true).unwrap().unwrap();
        assert_eq!(&first.body[..], b"msg-0");
    }

    #[test]
    fn test_in_use_survives_reload() {
        let dir = tempdir().unwrap();
        let config = manual_compaction(dir.path());
        let id = {
            let mut q = MessageStore::open("leased", config.clone()).unwrap();
            q.send(b"one").unwrap();
            q.send(b"two").unwrap();
            q.receive(false).unwrap().unwrap().id
        };

        let mut q = MessageStore::open("leased", config).unwrap();
        assert_eq!(q.pending_count(), 1);
        assert_eq!(q.in_use_count(), 1);
        assert!(q.is_in_use(&id));
        assert_eq!(&q.receive(true).unwrap().unwrap().body[..], b"two");
        assert!(q.ack(&id).unwrap());
    }

    #[test]
    fn test_fifo_order() {
        let dir = tempdir().unwrap();
        let mut q = MessageStore::open("/queue/fifo", StoreConfig::new(dir.path())).unwrap();

        for i in 0..1000 {
            q.send(format!("{i}").as_bytes()).unwrap();
        }
        let mut received = Vec::new();
        while let Some(msg) = q.receive(true).unwrap() {
            received.push(String::from_utf8(msg.body.to_vec()).unwrap());
        }

        let expected: Vec<String> = (0..1000).map(|i| i.to_string()).collect();
        assert_eq!(received, expected);
        assert_eq!(q.pending_count(), 0);
        assert_eq!(q.in_use_count(), 0);
    }

    #[test]
    fn test_ack_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut q = MessageStore::open("test", manual_compaction(dir.path())).unwrap();
        q.send(b"a").unwrap();
        q.send(b"b").unwrap();
        let msg = q.receive(false).unwrap().unwrap();

        assert!(q.ack(&msg.id).unwrap());
        let (pending, in_use) = (q.pending_count(), q.in_use_count());
        assert!(!q.ack(&msg.id).unwrap());
        assert!(!q.ack(&uuid::Uuid::new_v4()).unwrap());
        assert_eq!(q.pending_count(), pending);
        assert_eq!(q.in_use_count(), in_use);
    }

    #[test]
    fn test_compaction_preserves_active_records() {
        let dir = tempdir().unwrap();
        let mut q = MessageStore::open("/queue/compact", manual_compaction(dir.path())).unwrap();

        for i in 0..20 {
            q.send(format!("m{i}").as_bytes()).unwrap();
        }
        let mut received = Vec::new();
        for _ in 0..10 {
            received.push(q.receive(false).unwrap().unwrap());
        }
        let acked: Vec<_> = received.iter().take(5).map(|m| m.id).collect();
        for id in &acked {
            assert!(q.ack(id).unwrap());
        }

        let before = q.pending_count() + q.in_use_count() as u64;
        let old_len = q.file_len().unwrap();
        let stats = q.compact().unwrap();
        let after = q.pending_count() + q.in_use_count() as u64;

        assert_eq!(before, after);
        assert_eq!(stats.removed, 5);
        assert_eq!(stats.kept, 15);
        assert_eq!(stats.requeued, 0);
        assert!(q.file_len().unwrap() < old_len);
        assert_eq!(q.total_count(), 15);
        for m in received.iter().skip(5) {
            assert!(q.is_in_use(&m.id));
        }

        // Leases keep working against the rewritten offsets.
        for m in received.iter().skip(5) {
            assert!(q.ack(&m.id).unwrap());
        }
        let mut rest = Vec::new();
        while let Some(msg) = q.receive(true).unwrap() {
            assert!(!acked.contains(&msg.id));
            rest.push(String::from_utf8(msg.body.to_vec()).unwrap());
        }
        let expected: Vec<String> = (10..20).map(|i| format!("m{i}")).collect();
        assert_eq!(rest, expected);
    }

    #[test]
    fn test_lease_expiry_requeues_on_compaction() {
        let dir = tempdir().unwrap();
        let mut config = manual_compaction(dir.path());
        config.ack_timeout = Duration::from_millis(1);
        let mut q = MessageStore::open("/queue/lease", config).unwrap();

        let id = q.send(b"first").unwrap();
        q.send(b"second").unwrap();
        let msg = q.receive(false).unwrap().unwrap();
        assert_eq!(msg.id, id);
        assert_eq!(q.pending_count(), 1);

        sleep(Duration::from_millis(20));
        let stats = q.compact().unwrap();
        assert_eq!(stats.requeued, 1);
        assert_eq!(q.pending_count(), 2);
        assert_eq!(q.in_use_count(), 0);

        // The requeued record keeps its id and goes to the tail.
        let next = q.receive(true).unwrap().unwrap();
        assert_eq!(&next.body[..], b"second");
        let again = q.receive(true).unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(&again.body[..], b"first");
    }

    #[test]
    fn test_ratio_triggers_compaction() {
        let dir = tempdir().unwrap();
        let mut config = StoreConfig::new(dir.path());
        config.compaction.rewrite_interval = Duration::ZERO;
        let mut q = MessageStore::open("/queue/ratio", config).unwrap();

        for i in 0..10 {
            q.send(format!("{i}").as_bytes()).unwrap();
        }
        for _ in 0..9 {
            q.receive(true).unwrap().unwrap();
        }
        // 1 active of 10 total is not below 0.1.
        assert!(q.file_len().unwrap() > FILE_HEADER_SIZE);
        assert_eq!(q.total_count(), 10);

        q.receive(true).unwrap().unwrap();
        assert_eq!(q.file_len().unwrap(), FILE_HEADER_SIZE);
        assert_eq!(q.total_count(), 0);
    }

    #[test]
    fn test_compaction_cooldown() {
        let dir = tempdir().unwrap();
        let mut config = StoreConfig::new(dir.path());
        config.compaction.rewrite_interval = Duration::from_secs(3600);
        let mut q = MessageStore::open("/queue/cooldown", config).unwrap();

        q.send(b"a").unwrap();
        q.receive(true).unwrap().unwrap();
        assert_eq!(q.file_len().unwrap(), FILE_HEADER_SIZE);

        // A second compaction inside the cooldown window is suppressed.
        q.send(b"b").unwrap();
        q.receive(true).unwrap().unwrap();
        assert_eq!(q.file_len().unwrap(), FILE_HEADER_SIZE + record_size("b"));
    }

    #[test]
    fn test_size_triggers_compaction() {
        let dir = tempdir().unwrap();
        let mut config = manual_compaction(dir.path());
        config.compaction.max_file_bytes = Some(100);
        let mut q = MessageStore::open("/queue/size", config).unwrap();

        for body in ["aaaaa", "bbbbb", "ccccc"] {
            q.send(body.as_bytes()).unwrap();
        }
        q.receive(true).unwrap().unwrap();

        assert_eq!(
            q.file_len().unwrap(),
            FILE_HEADER_SIZE + 2 * record_size("bbbbb")
        );
        assert_eq!(q.pending_count(), 2);
    }

    #[test]
    fn test_file_layout_is_bit_exact() {
        let dir = tempdir().unwrap();
        let mut q = MessageStore::open("/queue/layout", manual_compaction(dir.path())).unwrap();
        let id = q.send(b"hi").unwrap();
        let raw = fs::read(q.path()).unwrap();

        assert_eq!(raw.len(), 12 + 48 + 2);
        assert_eq!(&raw[0..8], &12i64.to_le_bytes());
        assert_eq!(&raw[8..12], &1i32.to_le_bytes());
        assert_eq!(&raw[20..28], &0i64.to_le_bytes()); // dequeue_time
        assert_eq!(&raw[28..36], &0i64.to_le_bytes()); // ack_deadline
        assert_eq!(&raw[36..52], id.as_bytes());
        assert_eq!(&raw[52..56], &0u32.to_le_bytes());
        assert_eq!(&raw[56..60], &2u32.to_le_bytes());
        assert_eq!(&raw[60..62], b"hi");

        q.receive(false).unwrap().unwrap();
        let raw = fs::read(q.path()).unwrap();
        assert_eq!(&raw[0..8], &62i64.to_le_bytes());
        let dequeued = i64::from_le_bytes(raw[20..28].try_into().unwrap());
        let deadline = i64::from_le_bytes(raw[28..36].try_into().unwrap());
        assert!(dequeued > 0);
        assert_eq!(deadline - dequeued, 120_000);
    }

    #[test]
    fn test_truncated_tail_is_dropped() {
        let dir = tempdir().unwrap();
        let config = manual_compaction(dir.path());
        let path = {
            let mut q = MessageStore::open("/queue/torn", config.clone()).unwrap();
            q.send(b"complete").unwrap();
            q.send(b"torn-write").unwrap();
            q.path().to_path_buf()
        };
        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len - 3)
            .unwrap();

        let mut q = MessageStore::open("/queue/torn", config).unwrap();
        assert_eq!(q.pending_count(), 1);
        assert_eq!(
            q.file_len().unwrap(),
            FILE_HEADER_SIZE + record_size("complete")
        );
        assert_eq!(&q.receive(true).unwrap().unwrap().body[..], b"complete");
    }

    #[test]
    fn test_truncated_tail_fails_under_strict_policy() {
        let dir = tempdir().unwrap();
        let mut config = manual_compaction(dir.path());
        let path = {
            let mut q = MessageStore::open("/queue/strict", config.clone()).unwrap();
            q.send(b"payload").unwrap();
            q.path().to_path_buf()
        };
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(FILE_HEADER_SIZE + 20)
            .unwrap();

        config.recovery = RecoveryPolicy::Fail;
        let err = MessageStore::open("/queue/strict", config).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { offset: 12, .. }));
    }

    #[test]
    fn test_unsupported_version_is_rejected() {
        let dir = tempdir().unwrap();
        let config = manual_compaction(dir.path());
        let path = MessageStore::open("/queue/v", config.clone())
            .unwrap()
            .path()
            .to_path_buf();

        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(8)).unwrap();
        file.write_all(&7i32.to_le_bytes()).unwrap();
        drop(file);

        let err = MessageStore::open("/queue/v", config).unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedVersion { found: 7 }));
    }

    #[test]
    fn test_pending_record_behind_offset_is_redelivered() {
        let dir = tempdir().unwrap();
        let config = manual_compaction(dir.path());
        let path = {
            let mut q = MessageStore::open("/queue/rewind", config.clone()).unwrap();
            q.send(b"first").unwrap();
            q.send(b"second").unwrap();
            q.path().to_path_buf()
        };

        // Offset advanced past the first record but the record was never marked.
        let advanced = FILE_HEADER_SIZE + record_size("first");
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all(&(advanced as i64).to_le_bytes()).unwrap();
        drop(file);

        let mut q = MessageStore::open("/queue/rewind", config).unwrap();
        assert_eq!(q.pending_count(), 2);
        assert_eq!(&q.receive(true).unwrap().unwrap().body[..], b"first");
        assert_eq!(&q.receive(true).unwrap().unwrap().body[..], b"second");
    }

    #[test]
    fn test_destroy_removes_file() {
        let dir = tempdir().unwrap();
        let mut q = MessageStore::open("/queue/gone", manual_compaction(dir.path())).unwrap();
        q.send(b"x").unwrap();
        let path = q.path().to_path_buf();
        assert!(path.exists());

        q.destroy().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_store_file_name_is_base64() {
        let dir = tempdir().unwrap();
        let q = MessageStore::open("/queue/a", manual_compaction(dir.path())).unwrap();
        assert_eq!(
            q.path().file_name().unwrap().to_str().unwrap(),
            "L3F1ZXVlL2E=.msg.dat"
        );
    }

    #[test]
    fn test_queue_name_validation() {
        for bad in ["", " ", "a b", "q\u{1}", "foo>bar", ">", "quëue", "a,b"] {
            assert!(
                matches!(
                    validate_destination_name(bad),
                    Err(StoreError::InvalidName { .. })
                ),
                "{bad:?} should be rejected"
            );
        }
        for good in [
            "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ-_.0123456789",
            "/queue/orders",
            "/topic/logs.>",
        ] {
            assert!(validate_destination_name(good).is_ok(), "{good:?}");
        }

        let dir = tempdir().unwrap();
        assert!(MessageStore::open("bad name", manual_compaction(dir.path())).is_err());
    }

    /// Log that accepts `room` more bytes and then reports a full disk.
    struct FullDisk {
        bytes: Vec<u8>,
        room: usize,
    }

    impl Write for FullDisk {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.room == 0 {
                return Err(std::io::Error::other("no space left on device"));
            }
            let n = buf.len().min(self.room);
            self.bytes.extend_from_slice(&buf[..n]);
            self.room -= n;
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl AppendLog for FullDisk {
        fn truncate_to(&mut self, len: u64) -> std::io::Result<()> {
            self.bytes.truncate(len as usize);
            Ok(())
        }
    }

    #[test]
    fn test_failed_append_leaves_no_partial_record() {
        let mut log = FullDisk {
            bytes: vec![7; FILE_HEADER_SIZE as usize],
            room: 20,
        };
        let record = vec![1u8; record_size("payload") as usize];

        assert!(append_record(&mut log, FILE_HEADER_SIZE, &record).is_err());
        assert_eq!(log.bytes.len(), FILE_HEADER_SIZE as usize);

        log.room = record.len();
        append_record(&mut log, FILE_HEADER_SIZE, &record).unwrap();
        assert_eq!(log.bytes.len(), FILE_HEADER_SIZE as usize + record.len());
    }
}
