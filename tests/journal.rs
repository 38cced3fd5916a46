use partition_journal::{Error, Journal, OptionsBuilder};
use tempfile::tempdir;

fn open(dir: &std::path::Path) -> Journal {
    let opts = OptionsBuilder::new("p", dir).max_segment_size(4096).build().unwrap();
    Journal::open(opts).unwrap()
}

#[test]
fn open_empty_append_three_and_read_them_back() {
    let dir = tempdir().unwrap();
    let journal = open(dir.path());
    let writer = journal.writer();

    assert!(journal.is_empty());
    assert_eq!(writer.append_payload(b"one").unwrap(), 1);
    assert_eq!(writer.append_payload(b"two").unwrap(), 2);
    assert_eq!(writer.append_payload(b"three").unwrap(), 3);

    let mut reader = journal.open_reader().unwrap();
    let a = reader.next().unwrap().unwrap();
    let b = reader.next().unwrap().unwrap();
    let c = reader.next().unwrap().unwrap();
    assert_eq!(a.payload, b"one");
    assert_eq!(b.payload, b"two");
    assert_eq!(c.payload, b"three");
    assert!(reader.next().unwrap().is_none());
}

#[test]
fn appends_roll_across_segments_transparently() {
    let dir = tempdir().unwrap();
    let journal = open(dir.path());
    let writer = journal.writer();

    let payload = vec![7u8; 512];
    let mut last = 0;
    for _ in 0..50 {
        last = writer.append_payload(&payload).unwrap();
    }
    assert!(journal.last_index().unwrap() == last);

    let mut reader = journal.open_reader().unwrap();
    let mut count = 0;
    while reader.next().unwrap().is_some() {
        count += 1;
    }
    assert_eq!(count, 50);
}

#[test]
fn delete_after_truncates_and_rewinds_readers() {
    let dir = tempdir().unwrap();
    let journal = open(dir.path());
    let writer = journal.writer();

    for payload in [b"a" as &[u8], b"b", b"c", b"d", b"e"] {
        writer.append_payload(payload).unwrap();
    }

    let mut reader = journal.open_reader().unwrap();
    reader.next().unwrap();
    reader.next().unwrap();
    reader.next().unwrap(); // positioned to return index 4 next

    writer.delete_after(2).unwrap();
    assert_eq!(journal.last_index(), Some(2));

    // The reader was parked past the new tail; it must not return stale data.
    assert!(reader.next().unwrap().is_none());
    assert_eq!(reader.current_index(), 3);
}

#[test]
fn seek_finds_records_via_sparse_index_and_scan() {
    let dir = tempdir().unwrap();
    let journal = open(dir.path());
    let writer = journal.writer();

    for i in 1..=20u64 {
        writer.append_payload(format!("record-{i}").as_bytes()).unwrap();
    }

    let mut reader = journal.open_reader().unwrap();
    reader.seek(15).unwrap();
    let record = reader.next().unwrap().unwrap();
    assert_eq!(record.index, 15);
    assert_eq!(record.payload, b"record-15");
}

#[test]
fn seek_to_asqn_finds_largest_matching_index() {
    let dir = tempdir().unwrap();
    let journal = open(dir.path());
    let writer = journal.writer();

    writer.append(10, b"a").unwrap();
    writer.append(20, b"b").unwrap();
    writer.append(30, b"c").unwrap();

    let mut reader = journal.open_reader().unwrap();
    let found = reader.seek_to_asqn(25).unwrap();
    assert!(found);
    let record = reader.next().unwrap().unwrap();
    assert_eq!(record.payload, b"b");
}

#[test]
fn reset_empties_the_journal_and_renumbers_from_next_index() {
    let dir = tempdir().unwrap();
    let journal = open(dir.path());
    let writer = journal.writer();

    writer.append_payload(b"a").unwrap();
    writer.append_payload(b"b").unwrap();

    writer.reset(100).unwrap();
    assert!(journal.is_empty());
    assert_eq!(journal.first_index(), 100);

    assert_eq!(writer.append_payload(b"fresh").unwrap(), 100);
}

#[test]
fn crash_simulated_torn_tail_is_recovered_on_reopen() {
    let dir = tempdir().unwrap();
    let good_len;
    {
        let journal = open(dir.path());
        let writer = journal.writer();
        writer.append_payload(b"a").unwrap();
        good_len = std::fs::read_dir(dir.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .metadata()
            .unwrap()
            .len();
        writer.append_payload(b"bb").unwrap();
    }

    // Truncate the segment file partway into the second frame, simulating a
    // crash mid-write.
    let entry = std::fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap();
    let file = std::fs::OpenOptions::new().write(true).open(entry.path()).unwrap();
    file.set_len(good_len + 3).unwrap();

    let journal = open(dir.path());
    assert_eq!(journal.last_index(), Some(1));

    let writer = journal.writer();
    assert_eq!(writer.append_payload(b"c").unwrap(), 2);
}

#[test]
fn closed_journal_rejects_further_operations() {
    let dir = tempdir().unwrap();
    let journal = open(dir.path());
    let writer = journal.writer();
    writer.append_payload(b"a").unwrap();
    journal.close().unwrap();

    assert!(matches!(writer.append_payload(b"b"), Err(Error::Closed)));
    assert!(matches!(journal.open_reader(), Err(Error::Closed)));
}
