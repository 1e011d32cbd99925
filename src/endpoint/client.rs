use std::sync::Arc;

use tracing::debug;

use super::{
    bind_relay_socket, host_port, spawn_shim, Endpoint, HarnessError, Link, PeerAddr, Role,
};
use crate::config::{HarnessOptions, Implementation};

impl Endpoint {
    /// Start the client shim, pointed at a fresh relay socket.
    ///
    /// The client's own address is not known yet: the relay learns it from
    /// the first datagram the client sends.
    pub async fn client(
        implementation: &Implementation,
        case_args: &[String],
        options: &HarnessOptions,
    ) -> Result<Self, HarnessError> {
        let (socket, local) = bind_relay_socket(&options.bind_host).await?;
        let addr_arg = host_port(&options.advertise_host, local.port());
        debug!(relay = %local, "client relay socket bound");

        let io = spawn_shim(Role::Client, implementation, case_args, &addr_arg)?;

        Ok(Self {
            link: Link {
                role: Role::Client,
                socket: Arc::new(socket),
                peer: PeerAddr::default(),
            },
            io,
        })
    }
}
