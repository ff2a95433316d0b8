pub fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;108m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const BANNER: &str = r#"
                                   █████
                                  ░░███
 ████████   ██████   ████████  ████████   ███████
░░███░░███ ░░░░░███ ░░███░░███░███░░███  ███░░███
 ░███ ░███  ███████  ░███ ░░░ ░███ ░███ ░███ ░███
 ░███ ░███ ███░░███  ░███     ░███ ░███ ░███ ░███
 ░███████ ░░████████ █████    ░░███████ ░░████████
 ░███░░░   ░░░░░░░░ ░░░░░      ░░░░░███  ░░░░░░░░
 ░███                              ░███
 █████                             █████
░░░░░                             ░░░░░            "#;
    const APP_DESCRIPTION: &str =
        "Passive/Active Remote Queueing: upload-slot admission and fair queueing for peer-to-peer nodes.";
    const LIABILITY_NOTICE: &str =
        "MIT License disclaimer: software is provided \"AS IS\", without warranty or liability.";

    println!("{BANNER_COLOR}");
    println!("{BANNER}{RESET}");
    println!(
        "{} v{} | build {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("PARQD_BUILD_DATE_UTC")
    );
    println!("{APP_DESCRIPTION}");
    println!("{DIM_GRAY}{LIABILITY_NOTICE}{RESET}");
    println!();
    println!("================================================================");
    println!();
}
