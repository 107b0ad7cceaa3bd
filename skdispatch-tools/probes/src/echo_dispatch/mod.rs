/// Name of the `sk_lookup` program.
pub const PROGRAM: &str = "echo_dispatch";

/// Hash map of open ports. Key is the port number, the value is unused.
pub const PORTS_MAP: &str = "echo_ports";

/// One entry sockmap holding the service socket at key 0.
pub const SOCKET_MAP: &str = "echo_socket";

pub use skdispatch_probes::dispatch::{ENDPOINT_KEY, MAX_PORTS};
