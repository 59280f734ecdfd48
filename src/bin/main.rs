use std::{
    error::Error,
    fs,
    io::{self, BufRead, BufReader, Write},
    os::unix::{
        io::AsRawFd,
        net::{UnixListener, UnixStream},
    },
    process,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use seamless::{
    cli::{Cli, parse_args},
    config::parse_duration,
};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(1);

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    let config = args.seamless_config()?;
    // Returns only in the forked daemon body (or when seamless is disabled).
    let seamless = seamless::init(config);

    // With unix sockets the new generation unlinks and rebinds the path while
    // the old one keeps accepting on its already open descriptor until
    // shutdown. The old process must therefore never remove the socket.
    let _ = fs::remove_file(&args.socket);
    let listener = UnixListener::bind(&args.socket)?;
    info!("Listening on {:?} (pid {})", args.socket, process::id());

    let server = Arc::new(Server::new(listener));

    if let Some(delay) = args.shutdown_request_delay {
        seamless.on_shutdown_request(move || {
            info!("Holding restart acknowledgement for {delay:?}");
            thread::sleep(delay);
        });
    }

    let graceful_timeout = args.graceful_timeout;
    let shutdown_server = Arc::clone(&server);
    seamless.on_shutdown(move || shutdown_server.shutdown(graceful_timeout));

    seamless.started();
    server.serve();

    // The accept loop ends as soon as the shutdown callback starts; stay alive
    // until it has drained in-flight connections.
    seamless.wait();
    info!("Exiting");
    Ok(())
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// Minimal unix socket server answering every connection with its PID.
struct Server {
    listener: UnixListener,
    stopping: AtomicBool,
    in_flight: Arc<AtomicUsize>,
}

impl Server {
    fn new(listener: UnixListener) -> Self {
        Self {
            listener,
            stopping: AtomicBool::new(false),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Accepts connections until [`Server::shutdown`] is called.
    fn serve(&self) {
        while !self.stopping.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    if self.stopping.load(Ordering::SeqCst) {
                        break;
                    }
                    let in_flight = Arc::clone(&self.in_flight);
                    in_flight.fetch_add(1, Ordering::SeqCst);
                    thread::spawn(move || {
                        if let Err(err) = handle_connection(stream) {
                            debug!("Connection failed: {err}");
                        }
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) if self.stopping.load(Ordering::SeqCst) => break,
                Err(err) => {
                    error!("Listener error: {err}");
                    break;
                }
            }
        }
        debug!("Accept loop stopped");
    }

    /// Stops accepting and waits up to `timeout` for in-flight connections.
    ///
    /// The path may already belong to the next generation, so the blocked
    /// accept is woken by shutting the listening socket down rather than by
    /// connecting to it.
    fn shutdown(&self, timeout: Duration) {
        self.stopping.store(true, Ordering::SeqCst);
        if unsafe { libc::shutdown(self.listener.as_raw_fd(), libc::SHUT_RDWR) } == -1 {
            warn!("Could not wake accept loop: {}", io::Error::last_os_error());
        }

        let deadline = Instant::now() + timeout;
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                warn!("Graceful shutdown timeout, force closing");
                return;
            }
            thread::sleep(DRAIN_POLL_INTERVAL);
        }
    }
}

/// Reads an optional `delay=<duration>` request line, then answers with the
/// serving PID.
fn handle_connection(mut stream: UnixStream) -> io::Result<()> {
    stream.set_read_timeout(Some(REQUEST_READ_TIMEOUT))?;

    let mut line = String::new();
    let mut reader = BufReader::new(stream.try_clone()?);
    match reader.read_line(&mut line) {
        Ok(_) => {}
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ) => {}
        Err(err) => return Err(err),
    }

    if let Some(delay) = line.trim().strip_prefix("delay=")
        && let Ok(delay) = parse_duration(delay)
    {
        thread::sleep(delay);
    }

    writeln!(stream, "Server pid: {}", process::id())?;
    stream.flush()
}
