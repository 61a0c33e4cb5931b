use crate::client::{TabLink, TerminalMultiplexer};
use crate::error::{ApiError, ErrorCode, RelayResult};
use tokio::sync::mpsc;

/// End-of-transmission, sent once piped input runs dry.
const EOT: &[u8] = b"\x04";

/// Local side of an attached tab: keyboard or pipe input and window sizes.
pub struct LocalTerminal {
    pub input: mpsc::Receiver<Vec<u8>>,
    pub resizes: mpsc::Receiver<(u16, u16)>,
    /// Interactive sessions detach on input EOF. Piped input sends EOT instead
    /// and keeps relaying output until the remote side closes.
    pub interactive: bool,
}

/// Relay local input and window changes into `term_id` until its socket
/// closes. Input is held back until the socket is open.
pub async fn drive_tab(
    mux: &TerminalMultiplexer,
    term_id: &str,
    local: LocalTerminal,
    initial_size: Option<(u16, u16)>,
) -> RelayResult<()> {
    let LocalTerminal {
        mut input,
        mut resizes,
        interactive,
    } = local;
    let mut link = mux
        .subscribe_tab(term_id)
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "No socket for terminal"))?;

    let mut size = initial_size;
    let mut open = false;
    let mut input_done = false;
    let mut resizes_done = false;

    match *link.borrow_and_update() {
        TabLink::Open => {
            open = true;
            send_size(mux, term_id, size);
        }
        TabLink::Closed => return Ok(()),
        TabLink::Connecting => {}
    }

    loop {
        tokio::select! {
            changed = link.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *link.borrow_and_update();
                match state {
                    TabLink::Open => {
                        open = true;
                        send_size(mux, term_id, size);
                    }
                    TabLink::Closed => break,
                    TabLink::Connecting => {}
                }
            }
            chunk = input.recv(), if open && !input_done => match chunk {
                Some(bytes) => {
                    mux.send_renderer_input(term_id, &bytes);
                }
                None if interactive => break,
                None => {
                    tracing::debug!(term_id = %term_id, "Input ended; waiting for the remote side");
                    input_done = true;
                    mux.send_data(term_id, EOT);
                }
            },
            resized = resizes.recv(), if !resizes_done => match resized {
                Some(new_size) => {
                    size = Some(new_size);
                    if open {
                        send_size(mux, term_id, size);
                    }
                }
                None => resizes_done = true,
            },
        }
    }
    Ok(())
}

fn send_size(mux: &TerminalMultiplexer, term_id: &str, size: Option<(u16, u16)>) {
    if let Some((cols, rows)) = size {
        mux.send_resize(term_id, cols, rows);
    }
}
