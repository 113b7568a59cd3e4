use std::path::PathBuf;
use std::process::ExitCode;

const USAGE: &str = "usage: crm-login [login | serve [DIR]]";

enum Command {
    Login,
    Serve(Option<PathBuf>),
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Command, String> {
    let command = match args.next().as_deref() {
        None | Some("login") => Command::Login,
        Some("serve") => Command::Serve(args.next().map(PathBuf::from)),
        Some("-h") | Some("--help") => return Err(USAGE.to_string()),
        Some(other) => return Err(format!("unknown command {other:?}\n{USAGE}")),
    };
    if args.next().is_some() {
        return Err(USAGE.to_string());
    }
    Ok(command)
}

#[tokio::main]
async fn main() -> ExitCode {
    let command = match parse_args(std::env::args().skip(1)) {
        Ok(command) => command,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::from(2);
        }
    };

    let settings = match crm_login_lib::load_settings() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("failed to load settings: {err}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = match crm_login_lib::logging::init(&settings.logging) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("failed to initialize logging: {err}");
            None
        }
    };

    let result = match command {
        Command::Login => crm_login_lib::run_browser_login(&settings)
            .await
            .map(|identity| println!("{} <{}>", identity.display_name, identity.email)),
        Command::Serve(root) => crm_login_lib::run_static_server(&settings, root).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}
