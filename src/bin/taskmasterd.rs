// No tokio main here: daemonize() has to fork before the runtime starts its threads.
fn main() -> anyhow::Result<()> {
    taskmaster::tm::cli::run()
}
