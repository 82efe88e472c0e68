//! CLI command implementations.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::io::{AsyncBufReadExt, BufReader};

use dni_im_core::crypto::PublicKey;
use dni_im_core::identity::{FileIdentity, Fingerprint, Identity, IdentityProvider};
use dni_im_core::messaging::{Event, SendOutcome};
use dni_im_core::storage::{ContactBook, MessageQueue, CONTACTS_DB, QUEUE_DB};
use dni_im_core::{Config, Node, NodeHandle};

fn authenticate(config: &Config, name: &str) -> Result<Identity> {
    let mut provider = FileIdentity::new(&config.data_dir, name);
    Ok(provider.authenticate()?)
}

fn parse_fingerprint(raw: &str) -> Result<Fingerprint> {
    raw.parse::<Fingerprint>()
        .with_context(|| format!("'{raw}' is not a fingerprint"))
}

/// Initialize an identity.
pub fn init(config: &Config, name: &str) -> Result<()> {
    let provider = FileIdentity::new(&config.data_dir, name);
    if provider.exists() {
        bail!("identity already exists in {}", config.data_dir.display());
    }

    let identity = authenticate(config, name)?;
    println!("Identity created");
    println!("  Fingerprint: {}", identity.fingerprint());
    println!("  Name:        {}", identity.display_name());
    Ok(())
}

/// Show the local identity.
pub fn show_identity(config: &Config) -> Result<()> {
    let provider = FileIdentity::new(&config.data_dir, "anonymous");
    if !provider.exists() {
        bail!("no identity yet; run `dni-im init` first");
    }

    let identity = authenticate(config, "anonymous")?;
    println!("Fingerprint: {}", identity.fingerprint());
    println!("Name:        {}", identity.display_name());
    println!(
        "Static key:  {}",
        BASE64.encode(identity.static_public().as_bytes())
    );
    Ok(())
}

/// Run the node with a line-command interface.
pub async fn start(config: Config) -> Result<()> {
    let identity = authenticate(&config, "anonymous")?;
    let node = Node::start(config, identity).await?;
    let mut events = node.subscribe();

    println!("Listening on {}", node.local_addr());
    println!("Your fingerprint: {}", node.fingerprint());
    println!("Commands: /peers  /send <fp> <text>  /add <fp> <addr> <key-b64>  /delete <fp>  /quit");

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(_) => break,
            },
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                if handle_line(&node, line.trim()).await? {
                    break;
                }
            }
        }
    }

    node.shutdown().await;
    Ok(())
}

/// Returns true when the user asked to quit.
async fn handle_line(node: &NodeHandle, line: &str) -> Result<bool> {
    if line.is_empty() {
        return Ok(false);
    }

    let mut parts = line.splitn(2, ' ');
    let command = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or_default();

    match command {
        "/quit" | "/q" => return Ok(true),
        "/peers" => {
            let peers = node.list_peers().await?;
            if peers.is_empty() {
                println!("No peers known");
            }
            for peer in peers {
                println!(
                    "  {}  {:<20}  {}  ({})",
                    peer.fingerprint,
                    peer.name.unwrap_or_default(),
                    peer.addr,
                    peer.source
                );
            }
        }
        "/send" => {
            let mut args = rest.splitn(2, ' ');
            let (Some(fp), Some(text)) = (args.next(), args.next()) else {
                println!("usage: /send <fingerprint> <text>");
                return Ok(false);
            };
            let fingerprint = match parse_fingerprint(fp) {
                Ok(fingerprint) => fingerprint,
                Err(e) => {
                    println!("{e:#}");
                    return Ok(false);
                }
            };
            match node.send(fingerprint, 1, text.as_bytes().to_vec()).await {
                Ok(SendOutcome::Sent) => println!("sent"),
                Ok(SendOutcome::Queued) => println!("queued (peer not connected yet)"),
                Err(e) => println!("send failed: {e}"),
            }
        }
        "/add" => {
            let args: Vec<&str> = rest.split_whitespace().collect();
            let [fp, addr, key] = args.as_slice() else {
                println!("usage: /add <fingerprint> <ip:port> <static-key-base64>");
                return Ok(false);
            };
            let fingerprint = match parse_fingerprint(fp) {
                Ok(fingerprint) => fingerprint,
                Err(e) => {
                    println!("{e:#}");
                    return Ok(false);
                }
            };
            let Ok(addr) = addr.parse::<SocketAddr>() else {
                println!("'{addr}' is not an ip:port address");
                return Ok(false);
            };
            let key_bytes = match BASE64.decode(key) {
                Ok(bytes) if bytes.len() == 32 => bytes,
                _ => {
                    println!("'{key}' is not a base64 32-byte key");
                    return Ok(false);
                }
            };
            let mut raw = [0u8; 32];
            raw.copy_from_slice(&key_bytes);
            node.add_peer_manual(fingerprint, addr, PublicKey::from_bytes(raw)).await?;
            println!("peer added");
        }
        "/delete" => {
            let fingerprint = match parse_fingerprint(rest.trim()) {
                Ok(fingerprint) => fingerprint,
                Err(e) => {
                    println!("{e:#}");
                    return Ok(false);
                }
            };
            node.delete_peer(fingerprint).await?;
            println!("peer deleted");
        }
        other => println!("unknown command {other}"),
    }

    Ok(false)
}

fn print_event(event: &Event) {
    match event {
        Event::PeerDiscovered { fingerprint, name, source } => {
            println!(
                "[peer] {} {} via {}",
                fingerprint,
                name.as_deref().unwrap_or("(unnamed)"),
                source
            );
        }
        Event::PeerLost { fingerprint } => println!("[peer] {fingerprint} gone"),
        Event::SessionEstablished { fingerprint } => {
            println!("[session] established with {fingerprint}");
        }
        Event::SessionClosed { fingerprint, reason } => {
            println!("[session] {fingerprint} closed ({reason})");
        }
        Event::MessageReceived { fingerprint, stream_id, plaintext } => {
            let text = String::from_utf8_lossy(plaintext);
            println!("[{fingerprint}#{stream_id}] {text}");
        }
        Event::PinningViolation { fingerprint } => {
            println!("*** WARNING: {fingerprint} presented a different key than pinned!");
            println!("*** This may be an impersonation attempt. Verify out of band;");
            println!("*** `dni-im forget {fingerprint}` accepts the new key.");
        }
        Event::QueuePersistFailed { fingerprint } => {
            println!("[queue] could not persist message for {fingerprint}");
        }
    }
}

/// Start a node just long enough to deliver (or queue) one message.
pub async fn send_once(config: Config, fingerprint: &str, message: &str, stream: u16) -> Result<()> {
    let recipient = parse_fingerprint(fingerprint)?;
    let identity = authenticate(&config, "anonymous")?;
    let node = Node::start(config, identity).await?;
    let mut events = node.subscribe();

    // Give discovery a moment to find the recipient.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    let mut outcome = node.send(recipient, stream, message.as_bytes().to_vec()).await?;

    while outcome == SendOutcome::Queued && tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Ok(Event::SessionEstablished { fingerprint } )) if fingerprint == recipient => {
                // The queue drains on establishment; nothing left to send.
                outcome = SendOutcome::Sent;
            }
            Ok(Ok(Event::PinningViolation { fingerprint })) if fingerprint == recipient => {
                node.shutdown().await;
                bail!("pinned key mismatch for {recipient}; refusing to send");
            }
            _ => {}
        }
    }

    match outcome {
        SendOutcome::Sent => println!("delivered to {recipient}"),
        SendOutcome::Queued => println!("{recipient} is offline; message queued"),
    }

    // Let the final datagrams drain before the socket drops.
    tokio::time::sleep(Duration::from_millis(200)).await;
    node.shutdown().await;
    Ok(())
}

/// List pinned contacts.
pub fn list_contacts(config: &Config) -> Result<()> {
    let book = ContactBook::open(config.data_dir.join(CONTACTS_DB))?;
    let contacts = book.all()?;

    if contacts.is_empty() {
        println!("No contacts pinned yet");
        return Ok(());
    }

    for contact in contacts {
        println!(
            "  {}  {:<20}  pinned {}  key {}",
            contact.fingerprint,
            contact.name,
            contact.first_seen.format("%Y-%m-%d"),
            BASE64.encode(contact.static_pub.as_bytes())
        );
    }
    Ok(())
}

/// Rename a contact.
pub fn rename_contact(config: &Config, fingerprint: &str, name: &str) -> Result<()> {
    let fingerprint = parse_fingerprint(fingerprint)?;
    let book = ContactBook::open(config.data_dir.join(CONTACTS_DB))?;
    book.rename(fingerprint, name)?;
    println!("renamed {fingerprint} to {name}");
    Ok(())
}

/// Forget a contact's pin.
pub fn forget_contact(config: &Config, fingerprint: &str) -> Result<()> {
    let fingerprint = parse_fingerprint(fingerprint)?;
    let book = ContactBook::open(config.data_dir.join(CONTACTS_DB))?;
    if book.forget(fingerprint)? {
        println!("forgot pinned key for {fingerprint}");
    } else {
        println!("no pin stored for {fingerprint}");
    }
    Ok(())
}

/// Show queue depth per recipient.
pub fn queue_status(config: &Config) -> Result<()> {
    let queue = MessageQueue::open(config.data_dir.join(QUEUE_DB))?;
    let recipients = queue.recipients()?;

    if recipients.is_empty() {
        println!("Queue is empty");
        return Ok(());
    }

    for recipient in recipients {
        println!("  {}  {} pending", recipient, queue.count(recipient)?);
    }
    Ok(())
}
