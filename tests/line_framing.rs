use corebot::transport::FrameBuffer;

const STREAM: &[u8] = b"PING :a\r\n:srv 001 bot :hi\r\n\r\nNOTICE x\r\ntail";

fn frames_for(chunk: usize, capacity: usize) -> (Vec<Vec<u8>>, Vec<u8>) {
    let mut fb = FrameBuffer::with_capacity(capacity);
    let mut frames = Vec::new();
    for piece in STREAM.chunks(chunk) {
        let drained = fb.push(piece);
        assert_eq!(drained.discarded, 0);
        frames.extend(drained.frames);
    }
    (frames, fb.pending().to_vec())
}

#[test]
fn framing_does_not_depend_on_read_boundaries() {
    let (expected, tail) = frames_for(STREAM.len(), 64);
    assert_eq!(
        expected,
        vec![
            b"PING :a".to_vec(),
            b":srv 001 bot :hi".to_vec(),
            Vec::new(),
            b"NOTICE x".to_vec(),
        ]
    );
    assert_eq!(tail, b"tail");

    for chunk in 1..STREAM.len() {
        assert_eq!(frames_for(chunk, 64), (expected.clone(), tail.clone()), "chunk {}", chunk);
    }
}

#[test]
fn longest_message_is_capacity_minus_delimiter() {
    let mut fb = FrameBuffer::with_capacity(8);
    let drained = fb.push(b"123456\r\n");
    assert_eq!(drained.frames, vec![b"123456".to_vec()]);
    assert!(fb.is_empty());

    let drained = fb.push(b"1234567\r\n");
    assert!(drained.frames.is_empty());
    assert_eq!(drained.discarded, 8);
    // Only the newline of the discarded line is still pending.
    assert_eq!(fb.pending(), b"\n");
}

#[test]
fn capacity_has_a_floor() {
    let fb = FrameBuffer::with_capacity(0);
    assert_eq!(fb.capacity(), 3);
}
