//! Built-in shell tool server (stdio JSON-RPC).

use std::sync::Arc;

use ziya::servers::{run_stdio_server, shell::ShellServer};

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::io::Result<()> {
    let server = Arc::new(ShellServer::from_env());
    run_stdio_server(move |request| {
        let server = Arc::clone(&server);
        async move { server.handle_request(request).await }
    })
    .await
}
