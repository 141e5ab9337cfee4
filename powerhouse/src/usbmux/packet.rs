//! usbmuxd message framing
//!
//! Every message is a 16-byte little-endian header followed by an XML plist
//! body: `{ length, version = 1, message type = 8, tag }`, where `length`
//! includes the header itself. The tag echoes back in the response and
//! correlates request and reply.

use tokio::io::AsyncReadExt;

use crate::{PowerhouseError, ReadWrite, MAX_FRAME_LEN};

/// XML plist protocol version
pub(super) const XML_PLIST_VERSION: u32 = 1;
/// Plist message type
pub(super) const PLIST_MESSAGE_TYPE: u32 = 8;

const HEADER_LEN: u32 = 16;

/// Encodes a request dictionary into one framed mux message
pub(super) fn encode(req: &plist::Dictionary, tag: u32) -> Result<Vec<u8>, PowerhouseError> {
    let mut body = Vec::new();
    plist::to_writer_xml(&mut body, req)?;

    let mut out = Vec::with_capacity(HEADER_LEN as usize + body.len());
    out.extend_from_slice(&(HEADER_LEN + body.len() as u32).to_le_bytes());
    out.extend_from_slice(&XML_PLIST_VERSION.to_le_bytes());
    out.extend_from_slice(&PLIST_MESSAGE_TYPE.to_le_bytes());
    out.extend_from_slice(&tag.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Reads one framed mux message, returning its tag and decoded body
///
/// The length is validated against the transport cap before the payload is
/// allocated.
pub(super) async fn read(
    socket: &mut Box<dyn ReadWrite>,
) -> Result<(u32, plist::Dictionary), PowerhouseError> {
    let mut header = [0u8; HEADER_LEN as usize];
    socket.read_exact(&mut header).await?;

    // The buffer slices are statically sized, try_into cannot fail
    let len = u32::from_le_bytes(header[..4].try_into().unwrap());
    let tag = u32::from_le_bytes(header[12..16].try_into().unwrap());
    if len < HEADER_LEN {
        return Err(PowerhouseError::UnexpectedResponse);
    }
    if len > MAX_FRAME_LEN {
        return Err(PowerhouseError::OversizedFrame(len));
    }

    let mut body = vec![0; (len - HEADER_LEN) as usize];
    socket.read_exact(&mut body).await?;

    let res = plist::from_bytes(&body)?;
    Ok((tag, res))
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn round_trip_preserves_tag_and_body() {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ListDevices".into());

        let bytes = encode(&req, 7).unwrap();
        assert_eq!(
            u32::from_le_bytes(bytes[..4].try_into().unwrap()),
            bytes.len() as u32
        );
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 8);
        assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), 7);

        let (client, mut server) = tokio::io::duplex(4096);
        let mut socket: Box<dyn ReadWrite> = Box::new(client);
        server.write_all(&bytes).await.unwrap();

        let (tag, dict) = read(&mut socket).await.unwrap();
        assert_eq!(tag, 7);
        assert_eq!(
            dict.get("MessageType").and_then(|x| x.as_string()),
            Some("ListDevices")
        );
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut socket: Box<dyn ReadWrite> = Box::new(client);

        let mut header = Vec::new();
        header.extend_from_slice(&(MAX_FRAME_LEN + 1).to_le_bytes());
        header.extend_from_slice(&XML_PLIST_VERSION.to_le_bytes());
        header.extend_from_slice(&PLIST_MESSAGE_TYPE.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        server.write_all(&header).await.unwrap();

        assert!(matches!(
            read(&mut socket).await,
            Err(PowerhouseError::OversizedFrame(_))
        ));
    }
}
