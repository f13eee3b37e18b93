fn main() -> anyhow::Result<()> {
    fdbmonitor::monitor::main()
}
