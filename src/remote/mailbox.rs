//! Store-and-forward transport over a mailbox.
//!
//! Requests and responses travel as mail messages between two addresses:
//!
//! | Part | Request | Response |
//! |------|---------|----------|
//! | subject | `ExecuteNomadicMethod-Request>` + correlation id | `ExecuteNomadicMethod-Response>` + correlation id |
//! | body | `mode>file>hash>type>method>b64(params)>b64(nonlocals)` | `b64(envelope)` |
//! | attachment | module bytes, named after the module file (uploads only) | none |
//!
//! The `>`-delimited request body has exactly seven fields; the main-thread flag is not
//! carried. The client side is a [`MailboxChannel`] that polls its own address; the
//! server side is a [`MailboxListener`] that polls the server's address.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_skiplist::SkipMap;
use uuid::Uuid;

use crate::{
    ir::ExecutionMode,
    remote::{Channel, ChannelFactory, ExecutionServer, RemoteFault, Request, ResultEnvelope},
    utils::{from_base64, to_base64},
    Error, Result,
};

/// Subject prefix of request messages.
pub const REQUEST_SUBJECT_PREFIX: &str = "ExecuteNomadicMethod-Request>";

/// Subject prefix of response messages.
pub const RESPONSE_SUBJECT_PREFIX: &str = "ExecuteNomadicMethod-Response>";

const FIELD_SEPARATOR: char = '>';
const REQUEST_FIELDS: usize = 7;

/// One mail message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    /// Mailbox-assigned identifier, `0` until sent
    pub id: u64,
    /// Sender address
    pub from: String,
    /// Recipient address
    pub to: String,
    /// Subject line
    pub subject: String,
    /// Text body
    pub body: String,
    /// Named binary attachments
    pub attachments: BTreeMap<String, Vec<u8>>,
}

impl MailMessage {
    /// An unsent message without attachments.
    #[must_use]
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        MailMessage {
            id: 0,
            from: from.into(),
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
            attachments: BTreeMap::new(),
        }
    }

    /// Adds an attachment.
    #[must_use]
    pub fn with_attachment(mut self, name: impl Into<String>, data: Vec<u8>) -> Self {
        self.attachments.insert(name.into(), data);
        self
    }
}

/// A message store shared by mailbox clients and listeners.
pub trait Mailbox: Send + Sync {
    /// Stores `message`, returning its assigned identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the mailbox rejects the message.
    fn send(&self, message: MailMessage) -> Result<u64>;

    /// Messages addressed to `recipient` that were not deleted, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the mailbox cannot be read.
    fn fetch(&self, recipient: &str) -> Result<Vec<MailMessage>>;

    /// Deletes message `id`. A deleted message is never fetched again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the message cannot be deleted.
    fn mark_deleted(&self, id: u64) -> Result<()>;
}

/// A process-local [`Mailbox`] ordered by message id.
///
/// Deleting a message drops it from the store, so a long-running exchange keeps only
/// undelivered mail.
#[derive(Default)]
pub struct InMemoryMailbox {
    next_id: AtomicU64,
    messages: SkipMap<u64, MailMessage>,
}

impl InMemoryMailbox {
    /// An empty mailbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages not yet deleted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns `true` if every message was deleted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// A message by id, `None` once deleted.
    #[must_use]
    pub fn message(&self, id: u64) -> Option<MailMessage> {
        self.messages.get(&id).map(|entry| entry.value().clone())
    }
}

impl Mailbox for InMemoryMailbox {
    fn send(&self, mut message: MailMessage) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        message.id = id;
        self.messages.insert(id, message);
        Ok(id)
    }

    fn fetch(&self, recipient: &str) -> Result<Vec<MailMessage>> {
        Ok(self
            .messages
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|message| message.to == recipient)
            .collect())
    }

    fn mark_deleted(&self, id: u64) -> Result<()> {
        match self.messages.remove(&id) {
            Some(_) => Ok(()),
            None => Err(Error::Transport {
                endpoint: "mailbox".to_string(),
                message: format!("no message with id {id}"),
            }),
        }
    }
}

/// Encodes `request` as a message from `from` to `to`.
///
/// # Errors
///
/// Returns [`Error::InvalidOperation`] if a name contains the field separator and
/// [`Error::Codec`] if the variables cannot be encoded.
pub fn request_message(request: &Request, from: &str, to: &str) -> Result<MailMessage> {
    for field in [
        &request.module_file_name,
        &request.module_hash,
        &request.type_full_name,
        &request.method_name,
    ] {
        if field.contains(FIELD_SEPARATOR) {
            return Err(Error::InvalidOperation(format!(
                "'{field}' cannot travel in a mailbox request"
            )));
        }
    }

    let body = [
        request.mode.to_string(),
        request.module_file_name.clone(),
        request.module_hash.clone(),
        request.type_full_name.clone(),
        request.method_name.clone(),
        to_base64(&request.parameters)?,
        to_base64(&request.non_locals)?,
    ]
    .join(">");

    let mut message = MailMessage::new(
        from,
        to,
        format!("{REQUEST_SUBJECT_PREFIX}{}", request.correlation_id),
        body,
    );
    if let Some(bytes) = &request.module_bytes {
        message = message.with_attachment(&request.module_file_name, bytes.clone());
    }
    Ok(message)
}

/// Decodes a request message.
///
/// # Errors
///
/// Returns [`Error::Malformed`] for a wrong subject, a field count other than seven,
/// an unparsable correlation id or mode, and [`Error::Codec`] for undecodable variables.
pub fn parse_request(message: &MailMessage) -> Result<Request> {
    let correlation_id = correlation_id(&message.subject, REQUEST_SUBJECT_PREFIX)?;

    let fields: Vec<&str> = message.body.split(FIELD_SEPARATOR).collect();
    if fields.len() != REQUEST_FIELDS {
        return Err(malformed_error!(
            "Request body has {} fields, expected {}",
            fields.len(),
            REQUEST_FIELDS
        ));
    }

    let mode: ExecutionMode = fields[0]
        .parse()
        .map_err(|_| malformed_error!("Unknown execution mode '{}'", fields[0]))?;

    let mut request = Request::new(mode, fields[1], fields[2], fields[3], fields[4])
        .with_parameters(from_base64(fields[5])?)
        .with_non_locals(from_base64(fields[6])?);
    request.correlation_id = correlation_id;
    if let Some(bytes) = message.attachments.get(fields[1]) {
        request = request.with_module_bytes(bytes.clone());
    }
    Ok(request)
}

/// Encodes the answer to request `correlation_id`.
///
/// # Errors
///
/// Returns [`Error::Codec`] if the envelope cannot be encoded.
pub fn response_message(
    correlation_id: Uuid,
    envelope: &ResultEnvelope,
    from: &str,
    to: &str,
) -> Result<MailMessage> {
    Ok(MailMessage::new(
        from,
        to,
        format!("{RESPONSE_SUBJECT_PREFIX}{correlation_id}"),
        to_base64(envelope)?,
    ))
}

/// Decodes a response message into its correlation id and envelope.
///
/// # Errors
///
/// Returns [`Error::Malformed`] for a wrong subject or correlation id and
/// [`Error::Codec`] for an undecodable body.
pub fn parse_response(message: &MailMessage) -> Result<(Uuid, ResultEnvelope)> {
    let correlation_id = correlation_id(&message.subject, RESPONSE_SUBJECT_PREFIX)?;
    Ok((correlation_id, from_base64(message.body.trim())?))
}

fn correlation_id(subject: &str, prefix: &str) -> Result<Uuid> {
    let id = subject
        .strip_prefix(prefix)
        .ok_or_else(|| malformed_error!("Subject '{}' does not start with '{}'", subject, prefix))?;
    Uuid::parse_str(id).map_err(|_| malformed_error!("Invalid correlation id '{}'", id))
}

/// Client-side [`Channel`] over a [`Mailbox`].
///
/// Sends requests from its own address and polls that address for the matching
/// response. Responses for other correlation ids are left alone.
pub struct MailboxChannel {
    mailbox: Arc<dyn Mailbox>,
    address: String,
    endpoint: String,
    poll_interval: Duration,
    open: bool,
}

impl MailboxChannel {
    /// An unopened channel from `address` to `endpoint`.
    #[must_use]
    pub fn new(
        mailbox: Arc<dyn Mailbox>,
        address: impl Into<String>,
        endpoint: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        MailboxChannel {
            mailbox,
            address: address.into(),
            endpoint: endpoint.into(),
            poll_interval,
            open: false,
        }
    }

    fn poll(&self, correlation_id: Uuid) -> Result<Option<ResultEnvelope>> {
        for message in self.mailbox.fetch(&self.address)? {
            if !message.subject.starts_with(RESPONSE_SUBJECT_PREFIX) {
                continue;
            }
            let (id, envelope) = match parse_response(&message) {
                Ok(response) => response,
                Err(error) => {
                    log::warn!("Ignoring unreadable response {}: {error}", message.id);
                    continue;
                }
            };
            if id == correlation_id {
                self.mailbox.mark_deleted(message.id)?;
                return Ok(Some(envelope));
            }
        }
        Ok(None)
    }
}

impl Channel for MailboxChannel {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn exchange(&mut self, request: &Request, timeout: Option<Duration>) -> Result<ResultEnvelope> {
        if !self.open {
            return Err(Error::Transport {
                endpoint: self.endpoint.clone(),
                message: "channel is not open".to_string(),
            });
        }

        self.mailbox
            .send(request_message(request, &self.address, &self.endpoint)?)?;

        let deadline = timeout.map(|timeout| (Instant::now() + timeout, timeout));
        loop {
            if let Some(envelope) = self.poll(request.correlation_id)? {
                return Ok(envelope);
            }
            if let Some((deadline, timeout)) = deadline {
                if Instant::now() >= deadline {
                    return Err(request.timeout_error(timeout));
                }
            }
            thread::sleep(self.poll_interval);
        }
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn abort(&mut self) {
        self.open = false;
    }
}

/// Creates [`MailboxChannel`]s whose endpoints are mailbox addresses.
pub struct MailboxNetwork {
    mailbox: Arc<dyn Mailbox>,
    address: String,
    poll_interval: Duration,
}

impl MailboxNetwork {
    /// Channels sending from `address` through `mailbox`.
    #[must_use]
    pub fn new(mailbox: Arc<dyn Mailbox>, address: impl Into<String>, poll_interval: Duration) -> Self {
        MailboxNetwork {
            mailbox,
            address: address.into(),
            poll_interval,
        }
    }
}

impl ChannelFactory for MailboxNetwork {
    fn connect(&self, endpoint: &str) -> Result<Box<dyn Channel>> {
        Ok(Box::new(MailboxChannel::new(
            self.mailbox.clone(),
            self.address.clone(),
            endpoint,
            self.poll_interval,
        )))
    }
}

/// Outcome of one [`MailboxListener::poll_once`] pass.
#[derive(Debug, Default)]
pub struct PollReport {
    /// Requests executed and answered
    pub processed: usize,
    /// Requests that could not be decoded, by message id
    pub rejected: Vec<(u64, Error)>,
}

impl PollReport {
    /// Returns `true` if the pass saw no request at all.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.processed == 0 && self.rejected.is_empty()
    }
}

/// Server-side poller answering mailbox requests with an [`ExecutionServer`].
pub struct MailboxListener {
    mailbox: Arc<dyn Mailbox>,
    address: String,
    server: Arc<ExecutionServer>,
}

impl MailboxListener {
    /// A listener for requests addressed to `address`.
    #[must_use]
    pub fn new(mailbox: Arc<dyn Mailbox>, address: impl Into<String>, server: Arc<ExecutionServer>) -> Self {
        MailboxListener {
            mailbox,
            address: address.into(),
            server,
        }
    }

    /// Processes every pending request, replying to each sender and deleting each
    /// request.
    ///
    /// A request that cannot be decoded is deleted and reported in
    /// [`PollReport::rejected`]; its sender gets an invalid-request fault when the
    /// subject still carries a readable correlation id. The rest of the queue is
    /// processed either way.
    ///
    /// # Errors
    ///
    /// Mailbox failures are returned as they occur.
    pub fn poll_once(&self) -> Result<PollReport> {
        let mut report = PollReport::default();
        for message in self.mailbox.fetch(&self.address)? {
            if !message.subject.starts_with(REQUEST_SUBJECT_PREFIX) {
                continue;
            }
            let request = match parse_request(&message) {
                Ok(request) => request,
                Err(error) => {
                    log::error!(
                        "Rejecting mailbox request {} from {}: {error}",
                        message.id,
                        message.from
                    );
                    self.reject(&message, &error)?;
                    report.rejected.push((message.id, error));
                    continue;
                }
            };
            let correlation_id = request.correlation_id;
            log::debug!(
                "Mailbox request {} for {}::{} from {}",
                correlation_id,
                request.type_full_name,
                request.method_name,
                message.from
            );

            let envelope = self.server.execute(request);
            self.mailbox.send(response_message(
                correlation_id,
                &envelope,
                &self.address,
                &message.from,
            )?)?;
            self.mailbox.mark_deleted(message.id)?;
            report.processed += 1;
        }
        Ok(report)
    }

    fn reject(&self, message: &MailMessage, error: &Error) -> Result<()> {
        if let Ok(correlation_id) = correlation_id(&message.subject, REQUEST_SUBJECT_PREFIX) {
            let fault = ResultEnvelope::Fault(RemoteFault::from_error(error));
            self.mailbox.send(response_message(
                correlation_id,
                &fault,
                &self.address,
                &message.from,
            )?)?;
        }
        self.mailbox.mark_deleted(message.id)
    }
}
