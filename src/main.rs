fn main() -> anyhow::Result<()> {
    receiptwatch_lib::run()
}
