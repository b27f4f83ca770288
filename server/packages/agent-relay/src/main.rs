fn main() {
    if let Err(err) = agent_relay::cli::run_agent_relay() {
        tracing::error!(error = %err, "agent-relay failed");
        std::process::exit(1);
    }
}
