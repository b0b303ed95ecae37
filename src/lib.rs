pub mod audit;
pub mod config;
pub mod error;
pub mod fetch;
pub mod output;
pub mod parser;
pub mod pipeline;
pub mod record;
pub mod registry;
pub mod schedule;
pub mod storage;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}
