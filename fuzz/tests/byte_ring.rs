//! Bolero fuzzer for the byte-ring pointer arithmetic.
//!
//! Properties tested:
//! - Bytes come out in the order they went in
//! - free + used is always size - 1
//! - Wrapping writes split into a tail run and a head run from 0
//! - A side acting on a stale view of its peer never overruns

use bolero::check;
use rskt_fuzz::ring_model::{execute_and_verify, ring_size, RingOp};

fn main() {
    check!()
        .with_type::<(u8, Vec<RingOp>)>()
        .for_each(|(size_byte, ops)| {
            if let Err(e) = execute_and_verify(ring_size(*size_byte), ops) {
                panic!("Invariant violated: {}", e);
            }
        });
}

#[cfg(test)]
mod tests {
    use rskt_fuzz::ring_model::{execute_and_verify, ring_size, RingOp, MAX_RING};

    #[test]
    fn test_sizes_are_powers_of_two() {
        for raw in 0..=u8::MAX {
            let size = ring_size(raw);
            assert!(size.is_power_of_two());
            assert!((16..=MAX_RING).contains(&size));
        }
    }

    #[test]
    fn test_wrap_around() {
        // Fill 13 of 15 usable bytes, drain, then write across the end.
        let ops = vec![
            RingOp::Write(13),
            RingOp::PushWriter,
            RingOp::Read(13),
            RingOp::PushReader,
            RingOp::Write(5),
            RingOp::PushWriter,
            RingOp::Read(5),
        ];
        execute_and_verify(16, &ops).unwrap();
    }

    #[test]
    fn test_writer_blocks_on_stale_reader() {
        let ops = vec![
            RingOp::Write(100),
            RingOp::PushWriter,
            RingOp::Read(100),
            // The reader has not pushed yet, so the writer still sees a full ring.
            RingOp::Write(100),
            RingOp::PushReader,
            RingOp::Write(100),
            RingOp::PushWriter,
            RingOp::Read(7),
        ];
        execute_and_verify(16, &ops).unwrap();
    }
}
