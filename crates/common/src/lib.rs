// tandem-common: wire shapes shared by session clients and the signaling relay

pub mod presence;
pub mod signaling;
