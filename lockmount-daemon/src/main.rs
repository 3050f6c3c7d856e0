fn main() -> anyhow::Result<()> {
    lockmount_daemon::run()
}
