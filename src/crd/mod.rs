mod postgres_cluster;
mod postgres_upgrade;

pub use postgres_cluster::*;
pub use postgres_upgrade::*;
