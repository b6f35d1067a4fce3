use clap::{
    Arg, ArgAction, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};

/// Pure clap command definitions with zero business logic
#[must_use]
#[allow(clippy::too_many_lines)]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    Command::new(env!("CARGO_PKG_NAME"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .version(env!("CARGO_PKG_VERSION"))
        .color(ColorChoice::Auto)
        .styles(styles)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .help("Increase verbosity (-v info, -vv debug, -vvv trace)")
                .long("verbose")
                .short('v')
                .global(true)
                .action(ArgAction::Count),
        )
        .subcommand(
            Command::new("serve")
                .about("Accept TLS connections and echo back whatever clients send")
                .arg(
                    Arg::new("listen")
                        .env("TLSLISTEN_LISTEN")
                        .help("IP address to bind to (default: [::], accepts both IPv6 and IPv4)")
                        .long("listen")
                        .long_help(
                            "IP address to bind to:\n\
                            Not specified (default) binds to [::]:port which accepts both IPv6 and IPv4 connections.\n\
                            Falls back to 0.0.0.0:port if IPv6 is unavailable.\n\n\
                            Specific IPv4 examples: '0.0.0.0', '127.0.0.1'\n\
                            Specific IPv6: '::', '::1'"
                        )
                        .short('l')
                        .value_name("IP"),
                )
                .arg(
                    Arg::new("port")
                        .default_value("6080")
                        .env("TLSLISTEN_PORT")
                        .help("TLS listening port")
                        .long("port")
                        .short('p')
                        .value_parser(clap::value_parser!(u16)),
                )
                .arg(
                    Arg::new("metrics-port")
                        .default_value("9300")
                        .env("TLSLISTEN_METRICS_PORT")
                        .help("listening port for /metrics")
                        .long("metrics-port")
                        .short('m')
                        .value_parser(clap::value_parser!(u16)),
                )
                .arg(
                    Arg::new("name")
                        .default_value("tlslisten")
                        .env("TLSLISTEN_NAME")
                        .help("Subject common name and store nickname of the server identity")
                        .long("name")
                        .short('n'),
                )
                .arg(
                    Arg::new("store")
                        .env("TLSLISTEN_STORE")
                        .help("Directory for the persistent certificate store")
                        .long("store")
                        .long_help(
                            "Directory holding <name>.cert.der and <name>.key.der.\n\
                            The identity is generated on first start and reused until it\n\
                            expires. Without this option a fresh identity is generated in\n\
                            memory on every start.\n\n\
                            Example: /var/lib/tlslisten"
                        )
                        .value_name("DIR"),
                )
                .arg(
                    Arg::new("identity-cert")
                        .conflicts_with("store")
                        .env("TLSLISTEN_IDENTITY_CERT")
                        .help("PEM certificate of an existing server identity")
                        .long("identity-cert")
                        .long_help(
                            "Serve an existing identity instead of issuing a self-signed one.\n\
                            The first certificate in the file is used; requires --identity-key."
                        )
                        .requires("identity-key")
                        .value_name("PATH"),
                )
                .arg(
                    Arg::new("identity-key")
                        .env("TLSLISTEN_IDENTITY_KEY")
                        .help("PEM private key of --identity-cert")
                        .long("identity-key")
                        .requires("identity-cert")
                        .value_name("PATH"),
                )
                .arg(
                    Arg::new("session-cache")
                        .default_value("true")
                        .env("TLSLISTEN_SESSION_CACHE")
                        .help("Enable the server-side TLS session cache")
                        .long("session-cache")
                        .value_name("BOOL")
                        .value_parser(clap::value_parser!(bool)),
                )
                .arg(
                    Arg::new("session-tickets")
                        .default_value("true")
                        .env("TLSLISTEN_SESSION_TICKETS")
                        .help("Enable TLS session tickets")
                        .long("session-tickets")
                        .value_name("BOOL")
                        .value_parser(clap::value_parser!(bool)),
                )
                .arg(
                    Arg::new("request-cert")
                        .default_value("never")
                        .env("TLSLISTEN_REQUEST_CERT")
                        .help("When to ask clients for a certificate")
                        .long("request-cert")
                        .long_help(
                            "Client certificate request mode:\n\n\
                            - never: do not request a certificate (default)\n\
                            - always: request one, accept clients without\n\
                            - require-first-handshake: require one\n\
                            - require-always: require one\n\n\
                            Any presented certificate is accepted and reported with the connection."
                        )
                        .value_name("MODE")
                        .value_parser([
                            "never",
                            "always",
                            "require-first-handshake",
                            "require-always",
                        ]),
                ),
        )
        .subcommand(
            Command::new("probe")
                .about("Connect to a TLS server, report the negotiated parameters and check the echo")
                .arg(
                    Arg::new("host")
                        .default_value("127.0.0.1")
                        .env("TLSLISTEN_HOST")
                        .help("Server host name or IP address")
                        .long("host")
                        .short('H'),
                )
                .arg(
                    Arg::new("port")
                        .default_value("6080")
                        .env("TLSLISTEN_PORT")
                        .help("Server port")
                        .long("port")
                        .short('p')
                        .value_parser(clap::value_parser!(u16)),
                )
                .arg(
                    Arg::new("cert")
                        .env("TLSLISTEN_CLIENT_CERT")
                        .help("Path to a PEM client certificate")
                        .long("cert")
                        .value_name("PATH")
                        .requires("key"),
                )
                .arg(
                    Arg::new("key")
                        .env("TLSLISTEN_CLIENT_KEY")
                        .help("Path to the PEM private key of --cert")
                        .long("key")
                        .value_name("PATH")
                        .requires("cert"),
                )
                .arg(
                    Arg::new("message")
                        .default_value("HELLO")
                        .env("TLSLISTEN_MESSAGE")
                        .help("Payload sent to the server")
                        .long("message"),
                ),
        )
}
