fn main() -> anyhow::Result<()> {
    formlink::run()?;
    Ok(())
}
