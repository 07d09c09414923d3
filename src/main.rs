fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if handle_cli_flags(&args) {
        return;
    }

    if let Err(err) = comic_daily::run(args) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

/// Handles flags ahead of the command name; anything after it belongs to the command.
fn handle_cli_flags(args: &[String]) -> bool {
    let mut saw_flag = false;
    for arg in args.iter().take_while(|arg| arg.starts_with('-')) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("comic-daily {}", comic_daily::VERSION);
                saw_flag = true;
            }
            "--help" | "-h" => {
                println!(
                    "comic-daily: read, favorite and discuss the daily strip.\n\nUsage: comic-daily [--version|-V] [--help|-h] <command>\n\n{}",
                    comic_daily::app::USAGE
                );
                saw_flag = true;
            }
            _ => {}
        }
    }
    saw_flag
}
