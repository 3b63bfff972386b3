//! DNS wire format for single-question A lookups
use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;

pub const DNS_PORT: u16 = 53;

/// Size of the fixed message header.
pub const HEADER_LEN: usize = 12;

/// Largest name we will put in a question, in presentation form.
const MAX_NAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;

const FLAG_QR: u16 = 0x8000;
const FLAG_TC: u16 = 0x0200;
const FLAG_RD: u16 = 0x0100;

/// One resolved address with its time to live in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsRecord {
    pub address: Ipv4Addr,
    pub ttl: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    A,
}

impl QueryType {
    fn code(self) -> u16 {
        match self {
            QueryType::A => TYPE_A,
        }
    }
}

/// An outbound lookup bound to one nameserver.
#[derive(Debug, Clone)]
pub struct DnsQuery {
    pub nameserver: Ipv4Addr,
    pub hostname: String,
    pub query_type: QueryType,
    pub id: u16,
}

impl DnsQuery {
    pub fn new(nameserver: Ipv4Addr, hostname: &str, id: u16) -> Self {
        Self {
            nameserver,
            hostname: hostname.to_string(),
            query_type: QueryType::A,
            id,
        }
    }

    /// Encodes the query as a recursive single-question message.
    pub fn encode(&self) -> Result<Vec<u8>, DnsError> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.hostname.len() + 6);
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&FLAG_RD.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes()); // qdcount
        out.extend_from_slice(&[0; 6]); // an, ns, ar counts
        encode_name(&self.hostname, &mut out)?;
        out.extend_from_slice(&self.query_type.code().to_be_bytes());
        out.extend_from_slice(&CLASS_IN.to_be_bytes());
        Ok(out)
    }
}

fn encode_name(hostname: &str, out: &mut Vec<u8>) -> Result<(), DnsError> {
    let name = hostname.strip_suffix('.').unwrap_or(hostname);
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(DnsError::InvalidName(hostname.to_string()));
    }
    for label in name.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(DnsError::InvalidName(hostname.to_string()));
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    Ok(())
}

/// The fixed header of a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
}

impl Header {
    pub fn parse(message: &[u8]) -> Result<Self, DnsError> {
        let mut parser = Parser::new(message);
        let id = parser.u16()?;
        let flags = parser.u16()?;
        let qdcount = parser.u16()?;
        let ancount = parser.u16()?;
        // nscount and arcount are never read
        parser.take(4)?;
        Ok(Self {
            id,
            flags,
            qdcount,
            ancount,
        })
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_QR != 0
    }

    pub fn is_truncated(&self) -> bool {
        self.flags & FLAG_TC != 0
    }

    pub fn rcode(&self) -> u8 {
        (self.flags & 0x000f) as u8
    }

    /// Whether this message answers the query with the given ID.
    pub fn answers(&self, id: u16) -> bool {
        self.is_response() && self.id == id
    }
}

/// Walks the answer section of a response and collects its A records in
/// order. Records of other types are skipped.
pub fn parse_answers(message: &[u8]) -> Result<Vec<DnsRecord>, DnsError> {
    let header = Header::parse(message)?;
    let mut parser = Parser::new(message);
    parser.take(HEADER_LEN)?;

    for _ in 0..header.qdcount {
        parser.skip_name()?;
        parser.take(4)?; // qtype, qclass
    }

    let mut records = Vec::new();
    for _ in 0..header.ancount {
        parser.skip_name()?;
        let rtype = parser.u16()?;
        let class = parser.u16()?;
        let ttl = parser.u32()?;
        let rdlength = parser.u16()? as usize;
        let rdata = parser.take(rdlength)?;

        if rtype != TYPE_A || class != CLASS_IN {
            continue;
        }
        let octets: [u8; 4] = rdata
            .try_into()
            .map_err(|_| DnsError::Malformed("A record with bad rdata length"))?;
        records.push(DnsRecord {
            address: Ipv4Addr::from(octets),
            ttl,
        });
    }
    Ok(records)
}

/// Bounds-checked cursor over a received message.
struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DnsError> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or(DnsError::Malformed("length overflow"))?;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or(DnsError::Malformed("truncated message"))?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DnsError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DnsError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, DnsError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Skips an encoded name. A compression pointer ends the name; it is
    /// never followed.
    fn skip_name(&mut self) -> Result<(), DnsError> {
        loop {
            let head = self.u8()?;
            match head {
                0 => return Ok(()),
                1..=0x3f => {
                    self.take(head as usize)?;
                }
                0xc0..=0xff => {
                    self.u8()?;
                    return Ok(());
                }
                _ => return Err(DnsError::Malformed("reserved label type")),
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error("nameserver unreachable: {0}")]
    Unreachable(#[source] io::Error),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("malformed reply: {0}")]
    Malformed(&'static str),
    #[error("cannot encode hostname {0:?}")]
    InvalidName(String),
}
