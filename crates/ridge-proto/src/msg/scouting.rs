//! Scouting messages, exchanged over the multicast locator to discover
//! routers and peers before any session exists.

use crate::core::{PeerId, WhatAmI};

/// SCOUT — "who is out there?". `what` is a mask of [`crate::core::what`]
/// bits naming the roles the scout cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scout {
    pub version: u8,
    pub what: u8,
    pub zid: Option<PeerId>,
}

/// HELLO — a scouting answer carrying identity and reachable locators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: u8,
    pub whatami: WhatAmI,
    pub zid: PeerId,
    pub locators: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScoutingMessage {
    Scout(Scout),
    Hello(Hello),
}
