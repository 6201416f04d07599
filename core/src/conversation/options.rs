//! Conversation creation and search options.

use bitmask_enum::bitmask;

/// Options recorded on a conversation when it is created.
#[bitmask(u32)]
#[bitmask_config(vec_debug)]
pub enum ConvOptions {
    /// The second address is unknown and matches any address.
    NoAddr2,
    /// The second port is unknown and matches any port.
    NoPort2,
    /// The second port matches any port and is never filled in.
    NoPort2Force,
    /// Concrete matches spawn new conversations instead of consuming this one.
    Template,
    /// Keyed on the two addresses only.
    NoPorts,
}

impl ConvOptions {
    /// Returns `true` if the second port is wildcarded, whether or not it may be filled in.
    #[inline]
    pub fn port2_wildcarded(&self) -> bool {
        self.intersects(ConvOptions::NoPort2 | ConvOptions::NoPort2Force)
    }

    /// Panics on mutually exclusive option combinations.
    pub(crate) fn check(&self) {
        if self.contains(ConvOptions::NoPorts) {
            assert!(
                !self.intersects(
                    ConvOptions::NoAddr2 | ConvOptions::NoPort2 | ConvOptions::NoPort2Force
                ),
                "NO_PORTS cannot be combined with NO_ADDR2, NO_PORT2 or NO_PORT2_FORCE: {:?}",
                self
            );
        }
    }
}

/// Options selecting which endpoint fields of a query are wildcards.
#[bitmask(u32)]
#[bitmask_config(vec_debug)]
pub enum SearchOptions {
    /// Address B of the query is a wildcard.
    NoAddrB,
    /// Port B of the query is a wildcard.
    NoPortB,
    /// Match on the two addresses alone.
    NoPortX,
    /// Deinterlaced lookups ignore the anchor.
    NoAnc,
    /// Accept identifier elements of any conversation type.
    UseLastEndpoint,
}
