use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use tokio::sync::broadcast;

use davmail::{
    ClientStream, DavSessionFactory, GatewayError, HttpClientFacade, LdapConnection, Listener,
    SessionFactory, Settings, DEFAULT_LDAP_PORT,
};

#[derive(Parser)]
#[command(name = "davmail", about = "LDAP gateway to the Exchange Global Address List")]
struct Args {
    /// Settings file, davmail.properties format.
    #[arg(short, long, default_value = "davmail.properties")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> Result<(), GatewayError> {
    let settings = Arc::new(Settings::load(&args.config)?);

    let http = Arc::new(HttpClientFacade::new(settings.clone()));
    http.start()?;
    let factory: Arc<dyn SessionFactory> =
        Arc::new(DavSessionFactory::new(http.clone(), settings.clone()));

    let listener = Listener::bind(&settings, "LDAP", "davmail.ldapPort", DEFAULT_LDAP_PORT).await?;
    let client_timeout = listener.client_timeout();
    let (shutdown, _) = broadcast::channel(1);

    {
        let factory = factory.clone();
        let settings = settings.clone();
        let handler = move |stream: Box<dyn ClientStream>, _peer| {
            let connection = LdapConnection::new(factory.clone(), settings.clone());
            async move { connection.run(stream, client_timeout).await }
        };
        tokio::spawn(listener.serve(handler, shutdown.subscribe()));
    }

    wait_for_shutdown().await?;
    info!("shutting down");
    // Closing the channel unblocks the accept loop; the facade stop is
    // idempotent and safe against in-flight requests.
    let _ = shutdown.send(());
    http.stop();
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<(), GatewayError> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<(), GatewayError> {
    Ok(tokio::signal::ctrl_c().await?)
}
