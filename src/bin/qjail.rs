fn main() {
    std::process::exit(quickjail::cli::run(quickjail::cli::CliMode::Flags))
}
