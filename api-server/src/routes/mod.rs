pub mod backups;
pub mod events;
pub mod portals;
pub mod proxy;
pub mod servers;
