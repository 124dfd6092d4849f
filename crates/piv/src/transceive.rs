//! APDU transceive and the SP 800-73-4 chaining loop
//!
//! [`transceive`] drives a single exchange; [`transceive_chain`] fragments
//! long command data into 255-byte chained segments and reassembles chained
//! responses via GET RESPONSE (`INS_CONTINUE`), including the Le-correction
//! loop and two workarounds for common card bugs.

use bytes::{Bytes, BytesMut};
use pivkit_apdu_core::command::{CLA_CHAIN, CLA_ISO};
use pivkit_apdu_core::{CardTransport, Command, Response, StatusWord};
use tracing::debug;

use crate::consts::{ins_name, INS_CONTINUE};
use crate::error::{Error, Result};

/// Completed exchange: the final status word and the concatenated payload
#[derive(Debug)]
pub(crate) struct Reply {
    pub sw: StatusWord,
    pub data: Bytes,
}

impl Reply {
    /// Whether the status word is success or one of the warning classes
    /// that still carry a valid payload (62 XX, 63 XX)
    pub fn is_ok_or_warning(&self) -> bool {
        self.sw.is_success() || self.sw.is_warning_no_change() || self.sw.is_warning()
    }
}

/// Drive one request/response over the transport.
///
/// Transport failures surface as [`Error::Io`]; the status word is not
/// interpreted here.
pub(crate) fn transceive<T: CardTransport + ?Sized>(
    transport: &mut T,
    cmd: &Command,
) -> Result<Reply> {
    let raw = cmd.serialize().map_err(|e| match e {
        pivkit_apdu_core::Error::CommandTooLong(n) => Error::Length(format!(
            "command data of {n} bytes does not fit a short-form APDU"
        )),
        other => Error::Malformed(other.to_string()),
    })?;

    let reader = transport.reader_name().to_string();
    let resp_bytes = transport
        .transmit_raw(&raw)
        .map_err(|e| Error::io(&reader, Error::Pcsc(e)))?;

    let resp = Response::from_bytes(&resp_bytes)
        .map_err(|e| Error::io(&reader, Error::Malformed(e.to_string())))?;

    debug!(
        cla = cmd.cla,
        ins = cmd.ins,
        ins_name = ins_name(cmd.ins),
        p1 = cmd.p1,
        p2 = cmd.p2,
        lc = cmd.data.as_ref().map_or(0, |d| d.len()),
        le = cmd.le,
        sw = resp.status.to_u16(),
        sw_name = resp.status.name(),
        lr = resp.data.len(),
        "APDU exchanged"
    );

    Ok(Reply {
        sw: resp.status,
        data: resp.data,
    })
}

/// Send a command with arbitrarily long data and receive an arbitrarily
/// long response, chaining in both directions.
///
/// Unexpected status words are not an error here: the chain stops and the
/// reply is returned so the caller can map the status itself.
pub(crate) fn transceive_chain<T: CardTransport + ?Sized>(
    transport: &mut T,
    cmd: &Command,
) -> Result<Reply> {
    let data = cmd.data.clone().unwrap_or_default();
    let mut le = cmd.le;
    let mut offset = 0usize;

    let mut reply = BytesMut::new();
    let mut sw;
    let mut last_seg_len;

    // Send phase: fragment into 255-byte segments, chaining bit on all but
    // the last. Only the final segment's reply data is kept; earlier
    // segments do not carry response payloads.
    loop {
        let rem = data.len() - offset;
        let chained = rem > 0xFF;
        let seg_len = if chained { 0xFF } else { rem };

        let mut seg = Command {
            cla: if chained {
                cmd.cla | CLA_CHAIN
            } else {
                cmd.cla & !CLA_CHAIN
            },
            ins: cmd.ins,
            p1: cmd.p1,
            p2: cmd.p2,
            data: if data.is_empty() {
                None
            } else {
                Some(data.slice(offset..offset + seg_len))
            },
            le,
        };

        let r = loop {
            let r = transceive(transport, &seg)?;
            if r.sw.is_correct_le() {
                // Resend the same segment with the Le the card asked for.
                le = r.sw.sw2;
                seg.le = le;
                continue;
            }
            break r;
        };
        sw = r.sw;

        if sw.is_success() || sw.is_bytes_remaining() || sw.is_warning_no_change() || sw.is_warning()
        {
            reply.clear();
            reply.extend_from_slice(&r.data);
            last_seg_len = r.data.len();
            offset += seg_len;
        } else {
            // Any other status ends the chain; response chaining only
            // happens on BYTES_REMAINING. The caller inspects the status.
            return Ok(Reply { sw, data: r.data });
        }

        if offset >= data.len() {
            break;
        }
    }

    // Receive phase: pull further segments while the card reports more
    // bytes. Some cards return NO_ERROR with a full-length segment instead
    // of BYTES_REMAINING, so a CONTINUE is also tried in that case.
    let mut got_ok = false;
    while sw.is_bytes_remaining() || (sw.is_success() && last_seg_len >= 0xFF) {
        if sw.is_success() {
            got_ok = true;
        }
        if let Some(rem) = sw.remaining_bytes() {
            le = rem;
        }

        let cont = Command::new(CLA_ISO, INS_CONTINUE, 0, 0).with_le(le);
        let r = transceive(transport, &cont)?;
        sw = r.sw;
        last_seg_len = r.data.len();
        reply.extend_from_slice(&r.data);
    }

    // Some cards signal "no more data" with WRONG_DATA after a clean
    // segment; treat the whole exchange as successful then.
    #[cfg(feature = "quirk-wrong-data-tail")]
    if got_ok && sw == pivkit_apdu_core::response::status::common::WRONG_DATA {
        sw = pivkit_apdu_core::response::status::common::SUCCESS;
    }
    #[cfg(not(feature = "quirk-wrong-data-tail"))]
    let _ = got_ok;

    Ok(Reply {
        sw,
        data: reply.freeze(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pivkit_apdu_core::transport::MockTransport;

    fn cmd_with_data(len: usize) -> Command {
        Command::new_with_data(CLA_ISO, 0xDB, 0x3F, 0xFF, vec![0xAB; len])
    }

    #[test]
    fn test_single_exchange() {
        let mut t = MockTransport::with_response(Bytes::from_static(&[0x01, 0x02, 0x90, 0x00]));
        t.begin_transaction().unwrap();
        let r = transceive_chain(&mut t, &Command::new(0, 0xCB, 0x3F, 0xFF)).unwrap();
        assert!(r.sw.is_success());
        assert_eq!(r.data.as_ref(), &[0x01, 0x02]);
        assert_eq!(t.commands.len(), 1);
    }

    #[test]
    fn test_command_chaining_fragments() {
        // 600 bytes => ceil(600/255) = 3 segments
        let mut t = MockTransport::with_success();
        t.begin_transaction().unwrap();
        let r = transceive_chain(&mut t, &cmd_with_data(600)).unwrap();
        assert!(r.sw.is_success());
        assert_eq!(t.commands.len(), 3);

        // all but the last carry the chaining bit and 255 bytes of data
        for seg in &t.commands[..2] {
            assert_eq!(seg[0] & CLA_CHAIN, CLA_CHAIN);
            assert_eq!(seg[4], 0xFF);
            assert_eq!(seg.len(), 5 + 255);
        }
        let last = t.commands.last().unwrap();
        assert_eq!(last[0] & CLA_CHAIN, 0);
        assert_eq!(last[4], 90);
        assert_eq!(last.len(), 5 + 90 + 1);
    }

    #[test]
    fn test_command_chaining_exact_multiple() {
        // 510 = 2 * 255: a full-length final segment is sent unchained
        let mut t = MockTransport::with_success();
        t.begin_transaction().unwrap();
        transceive_chain(&mut t, &cmd_with_data(510)).unwrap();
        assert_eq!(t.commands.len(), 2);
        assert_eq!(t.commands[0][0] & CLA_CHAIN, CLA_CHAIN);
        assert_eq!(t.commands[1][0] & CLA_CHAIN, 0);
        assert_eq!(t.commands[1].len(), 5 + 255 + 1);
    }

    #[test]
    fn test_response_chaining_concatenates() {
        let mut first = vec![0x11u8; 0xFF];
        first.extend_from_slice(&[0x61, 0x20]);
        let mut second = vec![0x22u8; 0x20];
        second.extend_from_slice(&[0x90, 0x00]);

        let mut t = MockTransport::new(vec![Bytes::from(first), Bytes::from(second)]);
        t.begin_transaction().unwrap();
        let r = transceive_chain(&mut t, &Command::new(0, 0xCB, 0x3F, 0xFF)).unwrap();

        assert!(r.sw.is_success());
        assert_eq!(r.data.len(), 0xFF + 0x20);
        assert!(r.data[..0xFF].iter().all(|b| *b == 0x11));
        assert!(r.data[0xFF..].iter().all(|b| *b == 0x22));

        // second command is a CONTINUE with the Le from the status word
        let cont = &t.commands[1];
        assert_eq!(cont[1], INS_CONTINUE);
        assert_eq!(cont[4], 0x20);
    }

    #[test]
    fn test_correct_le_resends_segment() {
        let mut t = MockTransport::new(vec![
            Bytes::from_static(&[0x6C, 0x08]),
            Bytes::from_static(&[0xAA, 0xBB, 0x90, 0x00]),
        ]);
        t.begin_transaction().unwrap();
        let r = transceive_chain(&mut t, &Command::new(0, 0xCB, 0x3F, 0xFF)).unwrap();
        assert!(r.sw.is_success());
        assert_eq!(r.data.as_ref(), &[0xAA, 0xBB]);
        assert_eq!(t.commands.len(), 2);
        // resend carries the corrected Le
        assert_eq!(t.commands[1][4], 0x08);
    }

    #[test]
    fn test_unexpected_status_stops_chain() {
        let mut t = MockTransport::with_response(Bytes::from_static(&[0x69, 0x82]));
        t.begin_transaction().unwrap();
        let r = transceive_chain(&mut t, &cmd_with_data(600)).unwrap();
        assert_eq!(r.sw.to_u16(), 0x6982);
        // chain aborted after the first segment
        assert_eq!(t.commands.len(), 1);
    }

    #[cfg(feature = "quirk-wrong-data-tail")]
    #[test]
    fn test_wrong_data_tail_rewritten() {
        // full-length NO_ERROR segment, then a CONTINUE answered with
        // WRONG_DATA: the tail status is rewritten to success
        let mut first = vec![0x33u8; 0xFF];
        first.extend_from_slice(&[0x90, 0x00]);
        let mut t = MockTransport::new(vec![
            Bytes::from(first),
            Bytes::from_static(&[0x6A, 0x80]),
        ]);
        t.begin_transaction().unwrap();
        let r = transceive_chain(&mut t, &Command::new(0, 0xCB, 0x3F, 0xFF)).unwrap();
        assert!(r.sw.is_success());
        assert_eq!(r.data.len(), 0xFF);
    }
}
