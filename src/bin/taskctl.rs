fn main() -> anyhow::Result<()> {
    taskmaster::tm::ctl_cli::run()
}
