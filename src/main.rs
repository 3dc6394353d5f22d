fn main() {
    if let Err(error) = notula::cli::main() {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}
