use mmo_common::chunked::{
    ChunkFlag, ChunkPacket, ChunkReassembler, ChunkedWriter, CorrelationId, FifoChunkBuf, TransferState,
};

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

/// Send `data` in slices of `chunk_size`, check framing, return what the
/// receiver reassembled.
fn transfer(data: &[u8], chunk_size: usize) -> Vec<u8> {
    let writer = ChunkedWriter::new(0x3810, CorrelationId(77), data, chunk_size).unwrap();
    let packets: Vec<Vec<u8>> = writer.packets().collect();
    assert_eq!(packets.len(), data.len() / chunk_size + 1, "L={} C={}", data.len(), chunk_size);

    let mut acc = FifoChunkBuf::new();
    let last = packets.len() - 1;
    for (i, raw) in packets.iter().enumerate() {
        let packet = ChunkPacket::<CorrelationId>::parse(raw).unwrap();
        assert_eq!(packet.packet_id, 0x3810);
        assert_eq!(packet.prefix, CorrelationId(77));
        assert_eq!(packet.packet_len, raw.len());

        let expected = if i == last {
            ChunkFlag::Final
        } else if i == 0 {
            ChunkFlag::First
        } else {
            ChunkFlag::Middle
        };
        assert_eq!(packet.flag, expected.as_u8(), "packet {} of L={} C={}", i, data.len(), chunk_size);

        if i < last {
            assert_eq!(packet.data.len(), chunk_size);
        } else {
            assert_eq!(packet.data.len(), data.len() % chunk_size);
        }

        acc.push(&packet).unwrap();
    }

    assert_eq!(acc.state(), TransferState::Complete);
    acc.take().unwrap()
}

#[test]
fn test_round_trip_over_lengths_and_chunk_sizes() {
    let lengths = (0..=10_000).step_by(100).chain([1, 29, 30, 31, 9_999]);
    for len in lengths {
        let data = payload(len);
        for chunk_size in 1..=30 {
            assert_eq!(transfer(&data, chunk_size), data, "L={} C={}", len, chunk_size);
        }
    }
}

#[test]
fn test_text_payloads() {
    for text in [
        "test",
        "this is very long data line for chunked packets data.",
        "",
        "12345",
    ] {
        for chunk_size in [1, 5, 7, 100] {
            assert_eq!(transfer(text.as_bytes(), chunk_size), text.as_bytes());
        }
    }
}

#[test]
fn test_fifty_five_bytes_in_slices_of_five() {
    let data = b"this is very long data line for chunked packets data...";
    assert_eq!(data.len(), 55);

    let writer = ChunkedWriter::new(1, CorrelationId(0), data, 5).unwrap();
    let packets: Vec<Vec<u8>> = writer.packets().collect();

    // 11 full packets, then an empty final packet
    assert_eq!(packets.len(), 12);
    assert_eq!(packets[0][6], 0);
    assert!(packets[1..11].iter().all(|p| p[6] == 1));
    assert_eq!(packets[11][6], 2);
    assert_eq!(packets[11].len(), 7);
}

#[test]
fn test_zero_length_payload() {
    let writer = ChunkedWriter::new(1, CorrelationId(0), b"", 30).unwrap();
    let packets: Vec<Vec<u8>> = writer.packets().collect();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0][6], 2);

    let mut r = ChunkReassembler::<CorrelationId>::new();
    let done = r.push(&packets[0]).unwrap().unwrap();
    assert!(done.data.is_empty());
}

#[test]
fn test_many_interleaved_transfers() {
    let mut r = ChunkReassembler::<CorrelationId>::new();
    let payloads: Vec<Vec<u8>> = (0..10).map(|i| payload(100 + i * 37)).collect();
    let streams: Vec<Vec<Vec<u8>>> = payloads
        .iter()
        .enumerate()
        .map(|(i, p)| {
            ChunkedWriter::new(0x3801, CorrelationId(i as u16), p, 16)
                .unwrap()
                .packets()
                .collect()
        })
        .collect();

    let longest = streams.iter().map(Vec::len).max().unwrap();
    let mut completed = Vec::new();
    for step in 0..longest {
        for stream in &streams {
            if let Some(p) = stream.get(step) {
                if let Some(done) = r.push(p).unwrap() {
                    completed.push(done);
                }
            }
        }
    }

    assert_eq!(completed.len(), payloads.len());
    for done in completed {
        assert_eq!(done.data, payloads[done.prefix.0 as usize]);
    }
    assert_eq!(r.pending(), 0);
}
