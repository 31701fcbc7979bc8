//! Built-in time tool server (stdio JSON-RPC).

use ziya::servers::{run_stdio_server, time};

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::io::Result<()> {
    run_stdio_server(|request| async move { time::handle_request(&request) }).await
}
