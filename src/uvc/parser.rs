//! UVC bulk payload framing: splitting a raw bulk-in buffer into its
//! per-packet header and pixel data, and rejecting malformed packets.
//! Grounded on `uvc-streamer.cpp`'s `uvc_process_bulk_payload`.

/// Outcome of inspecting one bulk payload.
#[derive(Debug, PartialEq, Eq)]
pub enum PayloadOutcome {
    /// `header_len`, `data_len` — everything after the header is pixel
    /// data ready for delivery.
    Ok { header_len: usize, data_len: usize },
    /// Empty or single-byte transfer; not an error, just nothing to do.
    Empty,
    /// Bit 0x40 of the header-info byte was set (payload error bit).
    ErrorBit,
    /// `header_len` claimed to be larger than the whole payload.
    BogusHeaderLength,
}

/// The payload error bit (UVC 1.5 §2.4.3.3, "Error Bit").
const HEADER_INFO_ERROR_BIT: u8 = 0x40;

/// Inspect a raw bulk payload of `payload_len` bytes (the actual transfer
/// length, which may be less than the buffer's capacity). Never panics on
/// a too-short buffer: fewer than 2 bytes is treated as `Empty`.
pub fn inspect_payload(buffer: &[u8], payload_len: usize) -> PayloadOutcome {
    if payload_len < 2 {
        return PayloadOutcome::Empty;
    }
    let header_len = buffer[0] as usize;
    let header_info = buffer[1];

    if header_info & HEADER_INFO_ERROR_BIT != 0 {
        return PayloadOutcome::ErrorBit;
    }
    if header_len > payload_len {
        return PayloadOutcome::BogusHeaderLength;
    }

    PayloadOutcome::Ok {
        header_len,
        data_len: payload_len - header_len,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_or_single_byte_transfer_is_empty() {
        assert_eq!(inspect_payload(&[], 0), PayloadOutcome::Empty);
        assert_eq!(inspect_payload(&[5], 1), PayloadOutcome::Empty);
    }

    #[test]
    fn error_bit_set_is_rejected() {
        let buf = [12u8, 0x40, 0, 0];
        assert_eq!(inspect_payload(&buf, 4), PayloadOutcome::ErrorBit);
    }

    #[test]
    fn header_len_exceeding_payload_is_bogus() {
        let buf = [200u8, 0x00];
        assert_eq!(inspect_payload(&buf, 2), PayloadOutcome::BogusHeaderLength);
    }

    #[test]
    fn well_formed_payload_splits_header_and_data() {
        let buf = [12u8, 0x00, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xAA, 0xBB];
        match inspect_payload(&buf, buf.len()) {
            PayloadOutcome::Ok { header_len, data_len } => {
                assert_eq!(header_len, 12);
                assert_eq!(data_len, 2);
            }
            other => panic!("expected Ok, got {other:?}"),
        }
    }
}
