use std::process;

/// Signal handling and the callback connector assume a POSIX host.
pub fn ensure_posix_or_exit() {
    if !cfg!(unix) {
        eprintln!("unsupported platform: parqd is intended for POSIX systems");
        process::exit(2);
    }
}
