fn main() {
    if let Err(err) = photometric::run() {
        eprintln!("fatal: {err}");
        std::process::exit(1);
    }
}
