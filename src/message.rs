//! Assembly of complete request and response frames, including the
//! optional filtered payload wrapper.

use crate::buffer::{self, Buffer, BufferMut};
use crate::codec::{FilteredHeader, RequestHeader, ResponseHeader};
use crate::errors::Error;
use crate::filter::FilterChain;
use crate::net::frame::{finish_frame, FRAME_PREFIX_LEN};

/// Runs `clear` through `filters` and prepends the filtered payload wrapper.
fn wrap_filtered(clear: Vec<Buffer>, filters: &mut FilterChain) -> Result<Vec<Buffer>, Error> {
    let unfiltered_len = buffer::total_len(&clear);
    filters.reset();
    let filtered = filters.filter(&clear)?;
    let wrapper = FilteredHeader {
        filter_ids: filters.ids(),
        leading_len: 0,
        unfiltered_len,
    };
    let len = wrapper.encoded_len();
    let mut head = BufferMut::with_capacity(FRAME_PREFIX_LEN, len);
    wrapper.encode(head.append_zeroed(len), &mut 0);
    Ok(finish_frame(head, filtered))
}

/// Builds the frame for one call: envelope in its own buffer, the argument
/// payload shared untouched unless filters are installed.
pub(crate) fn encode_request(
    header: &RequestHeader,
    payload: &Buffer,
    filters: &mut FilterChain,
) -> Result<Vec<Buffer>, Error> {
    let len = header.encoded_len();
    let mut head = BufferMut::with_capacity(FRAME_PREFIX_LEN, len);
    header.encode(head.append_zeroed(len), &mut 0);

    if filters.is_empty() {
        return Ok(finish_frame(head, vec![payload.clone()]));
    }
    wrap_filtered(vec![head.freeze(), payload.clone()], filters)
}

/// Builds a response frame from a payload whose header is already in place.
pub(crate) fn encode_response(
    body: BufferMut,
    filters: Option<&mut FilterChain>,
) -> Result<Vec<Buffer>, Error> {
    match filters {
        Some(filters) if !filters.is_empty() => wrap_filtered(vec![body.freeze()], filters),
        _ => Ok(finish_frame(body, Vec::new())),
    }
}

/// Strips the filtered payload wrapper if present. Returns the cleartext
/// message and whether it was filtered.
pub(crate) fn unwrap_filtered(
    message: Buffer,
    filters: &mut FilterChain,
) -> Result<(Buffer, bool), Error> {
    match FilteredHeader::peek(&message)? {
        None => Ok((message, false)),
        Some((header, body)) => {
            if !filters.matches(&header.filter_ids) {
                return Err(Error::PayloadFilterMismatch);
            }
            filters.reset();
            let clear = filters.unfilter(body, header.unfiltered_len)?;
            Ok((clear, true))
        }
    }
}

/// Decodes a response message into its header and payload.
pub(crate) fn decode_response(
    message: Buffer,
    filters: &mut FilterChain,
) -> Result<(ResponseHeader, Buffer), Error> {
    let (clear, _) = unwrap_filtered(message, filters)?;
    let mut pos = 0;
    let header = ResponseHeader::decode(&clear, &mut pos)?;
    Ok((header, clear.slice_from(pos)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter;
    use crate::token::Token;

    fn strip_prefix(frame: &[Buffer]) -> Buffer {
        let all = buffer::concat(frame);
        let len = u32::from_be_bytes([all[0], all[1], all[2], all[3]]) as usize;
        assert_eq!(len, all.len() - 4);
        all.slice_from(4)
    }

    #[test]
    fn filtered_request_round_trip() {
        let header = RequestHeader::new("Echo", Token::none(), "Echo", 0);
        let payload = Buffer::from(b"arguments ".repeat(20));
        let mut ours = filter::FilterChain::new(vec![filter::zlib()]).unwrap();
        let mut theirs = filter::FilterChain::new(vec![filter::zlib()]).unwrap();

        let frame = encode_request(&header, &payload, &mut ours).unwrap();
        let (clear, filtered) = unwrap_filtered(strip_prefix(&frame), &mut theirs).unwrap();
        assert!(filtered);
        let mut pos = 0;
        assert_eq!(RequestHeader::decode(&clear, &mut pos).unwrap(), header);
        assert_eq!(&clear[pos..], &payload[..]);
    }

    #[test]
    fn mismatched_filters_are_reported() {
        let header = RequestHeader::new("Echo", Token::none(), "Echo", 0);
        let payload = Buffer::from(b"x".to_vec());
        let mut ours = filter::FilterChain::new(vec![filter::identity()]).unwrap();
        let mut theirs = filter::FilterChain::new(vec![filter::zlib()]).unwrap();
        let frame = encode_request(&header, &payload, &mut ours).unwrap();
        assert!(matches!(
            unwrap_filtered(strip_prefix(&frame), &mut theirs),
            Err(Error::PayloadFilterMismatch)
        ));
    }

    #[test]
    fn unfiltered_request_shares_the_payload() {
        let header = RequestHeader::new("Echo", Token::none(), "Echo", 0);
        let payload = Buffer::from(b"abc".to_vec());
        let frame = encode_request(&header, &payload, &mut FilterChain::default()).unwrap();
        assert_eq!(frame.len(), 2);
        assert!(frame[1].shares_allocation(&payload));
    }
}
