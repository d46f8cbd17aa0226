//! IPv4 CIDR block parsing and range arithmetic.
//!
//! # Purpose
//! Validates address blocks handed to the subnet allocator and answers the two
//! questions it needs: does a block fit inside its parent network, and does it
//! intersect a sibling block.
//!
//! # Notes
//! Ranges are compared as inclusive `[first, last]` pairs of 32-bit integers.
//! No I/O happens here; serialization against concurrent writers is the
//! allocator's job.
use crate::{Error, Result};
use ipnetwork::Ipv4Network;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Smallest prefix length (largest block) accepted for allocation.
pub const MIN_PREFIX_LEN: u8 = 16;
/// Largest prefix length (smallest block) accepted for allocation.
pub const MAX_PREFIX_LEN: u8 = 28;

const LINK_LOCAL_FIRST: u32 = u32::from_be_bytes([169, 254, 0, 0]);
const LINK_LOCAL_LAST: u32 = u32::from_be_bytes([169, 254, 255, 255]);

/// A parsed IPv4 network block such as `10.0.1.0/24`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CidrBlock {
    network: Ipv4Network,
}

impl CidrBlock {
    /// Parse `a.b.c.d/len` or `a.b.c.d/m.m.m.m`.
    ///
    /// Dotted masks must be contiguous. Host bits must be zero so that the
    /// textual form always names the network address.
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidCidr {
            block: input.to_string(),
            reason: reason.to_string(),
        };
        let (addr, mask) = input
            .trim()
            .split_once('/')
            .ok_or_else(|| invalid("missing prefix length"))?;
        let addr = Ipv4Addr::from_str(addr).map_err(|_| invalid("not an IPv4 address"))?;
        let prefix = if mask.contains('.') {
            let mask = Ipv4Addr::from_str(mask).map_err(|_| invalid("invalid netmask"))?;
            ipnetwork::ipv4_mask_to_prefix(mask).map_err(|_| invalid("non-contiguous netmask"))?
        } else {
            mask.parse::<u8>()
                .map_err(|_| invalid("invalid prefix length"))?
        };
        let network = Ipv4Network::new(addr, prefix).map_err(|_| invalid("prefix out of range"))?;
        if network.network() != addr {
            return Err(invalid("host bits are set"));
        }
        Ok(Self { network })
    }

    /// Reject blocks the allocator will not hand out.
    pub fn ensure_allocatable(&self) -> Result<()> {
        let prefix = self.prefix();
        if !(MIN_PREFIX_LEN..=MAX_PREFIX_LEN).contains(&prefix) {
            return Err(Error::InvalidCidr {
                block: self.to_string(),
                reason: format!(
                    "prefix length must be between {MIN_PREFIX_LEN} and {MAX_PREFIX_LEN}"
                ),
            });
        }
        if self.first() <= LINK_LOCAL_LAST && LINK_LOCAL_FIRST <= self.last() {
            return Err(Error::InvalidCidr {
                block: self.to_string(),
                reason: "overlaps the link-local range 169.254.0.0/16".to_string(),
            });
        }
        Ok(())
    }

    pub fn prefix(&self) -> u8 {
        self.network.prefix()
    }

    /// First address of the block as an integer.
    pub fn first(&self) -> u32 {
        u32::from(self.network.network())
    }

    /// Last address of the block as an integer.
    pub fn last(&self) -> u32 {
        u32::from(self.network.broadcast())
    }

    /// True when `other` lies entirely within this block.
    pub fn contains_block(&self, other: &CidrBlock) -> bool {
        self.first() <= other.first() && other.last() <= self.last()
    }

    /// Whether `child` can be carved out of this block. The block's last
    /// (broadcast) address is reserved, so a child may not reach it.
    pub fn can_allocate(&self, child: &CidrBlock) -> bool {
        self.first() <= child.first() && child.last() < self.last()
    }

    pub fn overlaps(&self, other: &CidrBlock) -> bool {
        self.first() <= other.last() && other.first() <= self.last()
    }

    /// Whether `addr` can be assigned to a host: inside the block and
    /// neither its network nor its broadcast address.
    pub fn contains_host(&self, addr: Ipv4Addr) -> bool {
        let addr = u32::from(addr);
        self.first() < addr && addr < self.last()
    }
}

impl fmt::Display for CidrBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network.network(), self.network.prefix())
    }
}

impl FromStr for CidrBlock {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        Self::parse(input)
    }
}
