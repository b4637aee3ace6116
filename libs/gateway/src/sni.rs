//! TLS ClientHello server-name extraction.
//!
//! Used when a TCP flow's destination IP has no reverse-DNS entry: the first
//! client payload is peeked for an SNI host name so domain rules can still
//! apply. Failure to parse is not an error; the IP-based decision stands.

/// Extracts the SNI host name from a TLS ClientHello.
///
/// Every read is bounds-checked; anything that does not look like a complete
/// ClientHello in a single record yields `None`.
pub fn parse_sni(payload: &[u8]) -> Option<String> {
    let mut r = Reader::new(payload);

    // TLS record header: type (22 = handshake), version, length.
    if r.u8()? != 22 {
        return None;
    }
    r.skip(2)?; // record version
    let record_len = r.u16()? as usize;
    let record = r.take(record_len)?;

    let mut r = Reader::new(record);

    // Handshake header: type (1 = ClientHello), 24-bit length.
    if r.u8()? != 1 {
        return None;
    }
    let handshake_len = r.u24()? as usize;
    let hello = r.take(handshake_len)?;

    let mut r = Reader::new(hello);

    r.skip(2)?; // client version
    r.skip(32)?; // random

    let session_id_len = r.u8()? as usize;
    r.skip(session_id_len)?;

    let cipher_suites_len = r.u16()? as usize;
    r.skip(cipher_suites_len)?;

    let compression_len = r.u8()? as usize;
    r.skip(compression_len)?;

    let extensions_len = r.u16()? as usize;
    let extensions = r.take(extensions_len)?;

    let mut r = Reader::new(extensions);

    while !r.is_empty() {
        let extension_type = r.u16()?;
        let extension_len = r.u16()? as usize;
        let extension = r.take(extension_len)?;

        if extension_type != 0 {
            continue; // Not server_name.
        }

        let mut r = Reader::new(extension);

        let list_len = r.u16()? as usize;
        let list = r.take(list_len)?;

        let mut r = Reader::new(list);

        while !r.is_empty() {
            let name_type = r.u8()?;
            let name_len = r.u16()? as usize;
            let name = r.take(name_len)?;

            if name_type != 0 {
                continue; // Only host_name entries carry a DNS name.
            }

            let host = std::str::from_utf8(name).ok()?;

            if host.is_empty() {
                return None;
            }

            return Some(host.to_ascii_lowercase());
        }
    }

    None
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.buf.get(self.pos..end)?;
        self.pos = end;

        Some(slice)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<u32> {
        self.take(3)
            .map(|b| u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }
}
