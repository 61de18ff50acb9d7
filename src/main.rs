fn main() {
    let args: Vec<_> = std::env::args().collect();
    if let Err(e) = petitboot_discover::run(args) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
