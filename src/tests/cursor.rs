use crate::{EventLoop, File, HeaderType, Mode, Op, TransferBuffer};
use tempfile::tempdir;

#[test]
fn cursor_advances_at_submission_not_completion() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cursor.bin");

    let event_loop = EventLoop::new().unwrap();
    let file = File::new(&event_loop);
    let first = TransferBuffer::new(&file, 8, HeaderType::None);
    let second = TransferBuffer::new(&file, 8, HeaderType::None);
    assert!(file.open(&path, Mode::NEW));

    first.payload_mut(|p| p[..4].copy_from_slice(b"AAAA")).unwrap();
    second.payload_mut(|p| p[..4].copy_from_slice(b"BBBB")).unwrap();

    // Back-to-back starts with no wait in between must claim disjoint
    // ranges: the second sees the cursor already advanced by the first.
    assert!(first.start(4, Op::WRITE));
    assert_eq!(file.position(), 4);
    assert!(second.start(4, Op::WRITE));
    assert_eq!(file.position(), 8);

    event_loop.block_on(async {
        first.until_not_busy().await;
        second.until_not_busy().await;
    });

    let reader = TransferBuffer::new(&file, 16, HeaderType::None);
    assert!(file.seek(0));
    assert!(reader.start(8, Op::READ));
    event_loop.block_on(reader.until_not_busy());
    assert_eq!(reader.transferred_bytes(), b"AAAABBBB");
}

#[test]
fn cursor_advances_by_requested_size() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("requested.bin");

    let event_loop = EventLoop::new().unwrap();
    let file = File::new(&event_loop);
    let writer = TransferBuffer::new(&file, 4, HeaderType::None);
    let reader = TransferBuffer::new(&file, 32, HeaderType::None);
    assert!(file.open(&path, Mode::NEW));

    writer.payload_mut(|p| p.copy_from_slice(b"wxyz")).unwrap();
    assert!(writer.start(4, Op::WRITE));
    event_loop.block_on(writer.until_not_busy());

    // A short read still consumes the full requested span of the cursor.
    assert!(file.seek(0));
    assert!(reader.start(32, Op::READ));
    event_loop.block_on(reader.until_not_busy());
    assert_eq!(reader.transferred(), 4);
    assert_eq!(file.position(), 32);
}

#[test]
fn seek_repositions_only_sequential_buffers() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("seek.bin");

    let event_loop = EventLoop::new().unwrap();
    let file = File::new(&event_loop);
    let seq = TransferBuffer::new(&file, 8, HeaderType::None);
    let at = TransferBuffer::new(&file, 8, HeaderType::Offset8);
    assert!(file.open(&path, Mode::NEW));
    assert!(file.resize(64));

    assert!(file.seek(16));
    seq.payload_mut(|p| p[..2].copy_from_slice(b"hi")).unwrap();
    assert!(seq.start(2, Op::WRITE));
    assert_eq!(file.position(), 18);

    // The offset buffer ignores the cursor entirely.
    assert!(at.set_header_u64(0));
    at.payload_mut(|p| p[..2].copy_from_slice(b"lo")).unwrap();
    assert!(at.start(2, Op::WRITE));
    assert_eq!(file.position(), 18);

    event_loop.block_on(async {
        seq.until_not_busy().await;
        at.until_not_busy().await;
    });

    let reader = TransferBuffer::new(&file, 32, HeaderType::Offset4);
    assert!(reader.set_header_u32(16));
    assert!(reader.start(2, Op::READ));
    event_loop.block_on(reader.until_not_busy());
    assert_eq!(reader.transferred_bytes(), b"hi");

    assert!(reader.set_header_u32(0));
    assert!(reader.start(2, Op::READ));
    event_loop.block_on(reader.until_not_busy());
    assert_eq!(reader.transferred_bytes(), b"lo");
}

#[test]
fn seek_is_rejected_while_closed() {
    let event_loop = EventLoop::new().unwrap();
    let file = File::new(&event_loop);
    assert!(!file.seek(10));
    assert_eq!(file.position(), 0);
}
