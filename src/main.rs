fn main() {
    std::process::exit(projguard::run());
}
