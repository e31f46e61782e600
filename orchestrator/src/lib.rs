pub mod api;
pub mod args;
pub mod config;
pub mod egress;
pub mod error;
pub mod fabric;
pub mod gateway;
pub mod health;
pub mod pipeline;
pub mod scheduler;
pub mod server;
pub mod worker;

#[cfg(test)]
pub mod testutil;

pub mod proto {
    pub mod otto {
        tonic::include_proto!("otto.v1");
    }
    pub mod handler {
        tonic::include_proto!("handler.v1");
    }
}
