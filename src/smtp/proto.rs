// Copyright 2022 OpenStax Poland
// Licensed under the MIT license. See LICENSE file in the project root for
// full license text.

//! SMTP protocol state machine

use std::{borrow::Cow, net::IpAddr};

use super::{
    hooks::{Capabilities, HookResult, HookSet},
    reply::Reply,
    session::{State, Transaction},
    transport::Io,
};

/// `Username:` in Base64
const LOGIN_USERNAME_PROMPT: &str = "VXNlcm5hbWU6";
/// `Password:` in Base64
const LOGIN_PASSWORD_PROMPT: &str = "UGFzc3dvcmQ6";

/// What the connection driver must do once a response has been written
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Continue,
    /// Run TLS negotiation, then continue
    StartTls,
    Close,
}

pub struct Response<'a> {
    pub data: &'a [u8],
    pub action: Action,
}

enum Command<'a> {
    Hello {
        /// Is this an Extended HELO (EHLO)?
        extended: bool,
        domain: Option<&'a str>,
    },
    StartTls,
    Auth(Option<&'a str>),
    Mail(Option<&'a str>),
    Recipient(Option<&'a str>),
    Data,
    Reset,
    Verify,
    Expand,
    Help,
    Noop,
    Quit,
    Unknown,
}

impl<'a> Command<'a> {
    fn parse(line: &'a str) -> Self {
        let line = line.trim_start();
        let (command, argument) = match line.split_once(|c: char| c.is_ascii_whitespace()) {
            Some((command, rest)) => (command, Some(rest.trim_start())),
            None => (line, None),
        };
        let argument = argument.filter(|argument| !argument.is_empty());

        if command.eq_ignore_ascii_case("EHLO") {
            Command::Hello { extended: true, domain: argument }
        } else if command.eq_ignore_ascii_case("HELO") {
            Command::Hello { extended: false, domain: argument }
        } else if command.eq_ignore_ascii_case("STARTTLS") {
            Command::StartTls
        } else if command.eq_ignore_ascii_case("AUTH") {
            Command::Auth(argument)
        } else if command.eq_ignore_ascii_case("MAIL") {
            Command::Mail(argument.map(|argument| strip_caseless(argument, "FROM:")))
        } else if command.eq_ignore_ascii_case("RCPT") {
            Command::Recipient(argument.map(|argument| strip_caseless(argument, "TO:")))
        } else if command.eq_ignore_ascii_case("DATA") {
            Command::Data
        } else if command.eq_ignore_ascii_case("RSET") {
            Command::Reset
        } else if command.eq_ignore_ascii_case("QUIT") {
            Command::Quit
        } else if command.eq_ignore_ascii_case("VRFY") {
            Command::Verify
        } else if command.eq_ignore_ascii_case("EXPN") {
            Command::Expand
        } else if command.eq_ignore_ascii_case("HELP") {
            Command::Help
        } else if command.eq_ignore_ascii_case("NOOP") {
            Command::Noop
        } else {
            Command::Unknown
        }
    }
}

/// Protocol state of a single connection
///
/// Lines read from the client are fed to [`Session::process_line`], which
/// consults the hooks and produces the bytes to send back.
pub struct Session {
    hooks: HookSet,
    capabilities: Capabilities,
    peer: IpAddr,
    state: State,
    client_domain: Option<String>,
    /// Decoded AUTH LOGIN responses received so far
    login: Vec<String>,
    transaction: Option<Transaction>,
    output: Vec<u8>,
}

impl Session {
    pub fn new(hooks: HookSet, peer: IpAddr) -> Self {
        let capabilities = hooks.capabilities();
        Session {
            hooks,
            capabilities,
            peer,
            state: State::default(),
            client_domain: None,
            login: Vec::new(),
            transaction: None,
            output: Vec::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Domain from the last accepted HELO or EHLO
    pub fn client_domain(&self) -> Option<&str> {
        self.client_domain.as_deref()
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    /// Greet a newly connected client
    ///
    /// The returned action is [`Action::Close`] when the client was refused.
    pub async fn start_session(&mut self) -> Response<'_> {
        self.output.clear();
        self.state = State::default();

        let accepted = match self.hooks.hooks().client_connection(self.peer).await {
            Ok(accepted) => accepted,
            Err(err) => {
                log::warn!("connection hook failed for {}: {err:#}", self.peer);
                false
            }
        };

        let domain = self.hooks.domain();
        let (reply, action) = if accepted {
            (Reply::new(220, format!("{domain} ESMTP service ready")), Action::Continue)
        } else {
            log::debug!("refusing connection from {}", self.peer);
            (Reply::new(554, format!("{domain} No SMTP service for you [{}] here", self.peer)),
                Action::Close)
        };

        self.reply(reply);
        Response { data: &self.output, action }
    }

    /// Handle one line received from the client
    ///
    /// The returned action is [`Action::Close`] exactly when the client has
    /// given QUIT.
    pub async fn process_line(&mut self, line: &[u8]) -> Response<'_> {
        self.output.clear();

        let mut action = Action::Continue;

        if self.state.data {
            self.data_line(line).await;
        } else if self.state.auth_plain_incomplete {
            let result = self.auth_plain_line(line).await;
            self.recover(result);
        } else if self.state.auth_login_incomplete {
            let result = self.auth_login_line(line).await;
            self.recover(result);
        } else {
            let text = String::from_utf8_lossy(line);
            let result = self.command_line(&text).await;
            action = self.recover(result).unwrap_or(Action::Continue);
        }

        if self.state.quit {
            action = Action::Close;
        }

        Response { data: &self.output, action }
    }

    /// Run TLS negotiation over `stream` after STARTTLS was accepted
    ///
    /// On success the session returns to its initial state, with only TLS
    /// remembered, and continues over the returned stream.
    pub async fn start_tls(&mut self, stream: Box<dyn Io>) -> HookResult<Box<dyn Io>> {
        let stream = match self.hooks.tls() {
            Some(tls) => tls.start_tls(self.peer, stream).await?,
            None => stream,
        };

        self.state = State { starttls: true, ..State::default() };
        self.client_domain = None;
        self.transaction = None;
        self.login.clear();

        Ok(stream)
    }

    /// Turn a failed hook into a 451 reply, leaving state as it was
    fn recover<T>(&mut self, result: HookResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                log::warn!("hook failed for {}: {err:#}", self.peer);

                // A half-finished AUTH exchange can't be resumed.
                self.state.auth_plain_incomplete = false;
                self.state.auth_login_incomplete = false;
                self.login.clear();

                self.reply(Reply::new(451, err.to_string()));
                None
            }
        }
    }

    fn reply(&mut self, reply: Reply) {
        reply.write_to(&mut self.output);
    }

    async fn command_line(&mut self, line: &str) -> HookResult<Action> {
        match Command::parse(line) {
            Command::Hello { extended, domain } => self.hello(extended, domain).await?,
            Command::StartTls => return Ok(self.starttls()),
            Command::Auth(argument) => self.auth(argument).await?,
            Command::Mail(argument) => self.mail(argument).await?,
            Command::Recipient(argument) => self.recipient(argument).await?,
            Command::Data => self.data().await?,
            Command::Reset => self.reset(),
            Command::Quit => self.quit(),
            // A server must not claim success for VRFY or EXPN without
            // actually verifying the address.
            Command::Verify | Command::Expand =>
                self.reply(Reply::new(252, "Administrative prohibition")),
            Command::Help => self.help(),
            Command::Noop => self.reply(Reply::new(250, "Ok")),
            Command::Unknown => self.unknown(),
        }

        Ok(Action::Continue)
    }

    async fn hello(&mut self, extended: bool, domain: Option<&str>) -> HookResult<()> {
        let domain = match domain.filter(|domain| is_hostname_like(domain)) {
            Some(domain) => domain,
            None => {
                let syntax = if extended { "Syntax: EHLO hostname" } else { "Syntax: HELO hostname" };
                self.reply(Reply::new(501, syntax));
                return Ok(());
            }
        };

        if !self.hooks.hooks().ehlo_domain_received(domain).await? {
            self.reply(Reply::new(550, "Requested action not taken"));
            return Ok(());
        }

        let server = self.hooks.domain().to_owned();
        if extended {
            let mut lines = vec![server];
            lines.extend(self.capabilities.ehlo_keywords());
            self.reply(Reply::multiline(250, lines));
        } else {
            self.reply(Reply::new(250, server));
        }

        self.reset_protocol_state();
        self.state.ehlo = true;
        self.client_domain = Some(domain.to_owned());

        Ok(())
    }

    fn starttls(&mut self) -> Action {
        if !self.capabilities.starttls {
            self.unknown();
            return Action::Continue;
        }

        if self.state.starttls {
            self.reply(Reply::new(503, "TLS already negotiated"));
            Action::Continue
        } else if !self.state.ehlo {
            self.reply(Reply::new(503, "EHLO required before STARTTLS"));
            Action::Continue
        } else {
            self.reply(Reply::new(220, "Start TLS negotiation"));
            Action::StartTls
        }
    }

    async fn auth(&mut self, argument: Option<&str>) -> HookResult<()> {
        if !self.capabilities.auth {
            self.unknown();
            return Ok(());
        }

        if self.state.auth {
            self.reply(Reply::new(503, "Already authenticated"));
            return Ok(());
        }

        let argument = argument.unwrap_or_default();
        let (mechanism, initial) = match argument.split_once(|c: char| c.is_ascii_whitespace()) {
            Some((mechanism, initial)) => (mechanism, Some(initial.trim())),
            None => (argument, None),
        };
        let initial = initial.filter(|initial| !initial.is_empty());

        if mechanism.eq_ignore_ascii_case("PLAIN") {
            match initial {
                Some(response) => self.auth_plain_line(response.as_bytes()).await?,
                None => {
                    self.state.auth_plain_incomplete = true;
                    self.reply(Reply::new(334, ""));
                }
            }
        } else if mechanism.eq_ignore_ascii_case("LOGIN") {
            self.state.auth_login_incomplete = true;
            match initial {
                Some(response) => self.auth_login_line(response.as_bytes()).await?,
                None => self.reply(Reply::new(334, LOGIN_USERNAME_PROMPT)),
            }
        } else {
            self.reply(Reply::new(504, "Unrecognized authentication mechanism"));
        }

        Ok(())
    }

    /// Initial response of AUTH PLAIN: `authzid NUL authcid NUL password`
    async fn auth_plain_line(&mut self, line: &[u8]) -> HookResult<()> {
        self.state.auth_plain_incomplete = false;

        let decoded = match self.decode_auth_response(line) {
            Some(decoded) => decoded,
            None => return Ok(()),
        };

        // An empty authorization identity means "same as the user".
        let mut parts = decoded.split(|&c| c == 0).skip(1);
        let user = parts.next().map(String::from_utf8_lossy).unwrap_or_default();
        let password = parts.next().map(String::from_utf8_lossy).unwrap_or_default();

        self.authenticate(&user, &password).await
    }

    async fn auth_login_line(&mut self, line: &[u8]) -> HookResult<()> {
        let decoded = match self.decode_auth_response(line) {
            Some(decoded) => decoded,
            None => {
                self.state.auth_login_incomplete = false;
                self.login.clear();
                return Ok(());
            }
        };

        self.login.push(String::from_utf8_lossy(&decoded).into_owned());

        if self.login.len() < 2 {
            self.reply(Reply::new(334, LOGIN_PASSWORD_PROMPT));
            return Ok(());
        }

        let password = self.login.pop().unwrap_or_default();
        let user = self.login.pop().unwrap_or_default();
        self.state.auth_login_incomplete = false;

        self.authenticate(&user, &password).await
    }

    /// Decode a Base64 AUTH response, replying 501 if it was cancelled or
    /// malformed
    fn decode_auth_response(&mut self, line: &[u8]) -> Option<Vec<u8>> {
        let line = trim_ascii(line);

        if line == b"*" {
            self.reply(Reply::new(501, "Authentication cancelled"));
            return None;
        }

        match base64::decode(line) {
            Ok(decoded) => Some(decoded),
            Err(_) => {
                self.reply(Reply::new(501, "Invalid Base64 data"));
                None
            }
        }
    }

    async fn authenticate(&mut self, user: &str, password: &str) -> HookResult<()> {
        let accepted = match self.hooks.authenticator() {
            Some(auth) => auth.plain_auth_received(user, password).await?,
            None => false,
        };

        if accepted {
            log::debug!("{} authenticated as {user}", self.peer);
            self.state.auth = true;
            self.reply(Reply::new(235, "Authentication ok"));
        } else {
            self.reply(Reply::new(535, "Invalid authentication"));
        }

        Ok(())
    }

    async fn mail(&mut self, argument: Option<&str>) -> HookResult<()> {
        if self.state.mail_from {
            self.reply(Reply::new(503, "Sender already given"));
            return Ok(());
        }

        let (path, parameters) = match split_path(argument) {
            Some(split) => split,
            None => {
                self.reply(Reply::new(501, "Syntax: MAIL FROM:<address>"));
                return Ok(());
            }
        };

        // Null sender is spelled <>
        if !path.contains('@') && !path.contains("<>") {
            self.reply(Reply::new(501, "Syntax: MAIL FROM:<address>"));
            return Ok(());
        }

        if let Some(limit) = self.capabilities.max_message_size {
            match declared_size(parameters) {
                Err(()) => {
                    self.reply(Reply::new(501, "Syntax: SIZE=<number>"));
                    return Ok(());
                }
                Ok(Some(size)) if size > limit => {
                    self.reply(Reply::new(552, "Message size exceeds fixed maximum message size"));
                    return Ok(());
                }
                Ok(_) => {}
            }
        }

        let sender = unbracket(path);

        if !self.hooks.hooks().sender_received(sender).await? {
            self.reply(Reply::new(550, "Sender is unacceptable"));
            return Ok(());
        }

        self.reply(Reply::new(250, "Ok"));
        self.state.mail_from = true;
        self.transaction = Some(Transaction::new(sender.to_owned()));

        Ok(())
    }

    async fn recipient(&mut self, argument: Option<&str>) -> HookResult<()> {
        if !self.state.mail_from {
            self.reply(Reply::new(503, "No sender given"));
            return Ok(());
        }

        let path = match split_path(argument) {
            Some((path, _)) if path.contains('@') => path,
            _ => {
                self.reply(Reply::new(501, "Syntax: RCPT TO:<address>"));
                return Ok(());
            }
        };

        let recipient = unbracket(path);

        if !self.hooks.hooks().recipient_received(recipient).await? {
            self.reply(Reply::new(550, "Recipient is unacceptable"));
            return Ok(());
        }

        self.reply(Reply::new(250, "Ok"));
        self.state.rcpt = true;
        self.transaction
            .get_or_insert_with(Transaction::default)
            .recipients
            .push(recipient.to_owned());

        Ok(())
    }

    async fn data(&mut self) -> HookResult<()> {
        if !self.state.rcpt {
            self.reply(Reply::new(503, "No valid recipients"));
            return Ok(());
        }

        self.hooks.hooks().data_command_received().await?;

        self.reply(Reply::new(354, "End data with <CR><LF>.<CR><LF>"));
        self.state.data = true;

        Ok(())
    }

    async fn data_line(&mut self, line: &[u8]) {
        if line == b"." {
            self.finish_message().await;
            self.state.end_transaction();
            return;
        }

        let line = line.strip_prefix(b".").unwrap_or(line);
        let keep_body = self.hooks.delivery().is_some();
        let limit = self.capabilities.max_message_size;
        let transaction = self.transaction.get_or_insert_with(Transaction::default);

        transaction.size += line.len() + 2;

        if transaction.failure.is_some() || limit.map_or(false, |limit| transaction.size > limit) {
            return;
        }

        if keep_body {
            transaction.body.extend_from_slice(line);
            transaction.body.extend_from_slice(b"\r\n");
        }

        if let Err(err) = self.hooks.hooks().data_line_received(line).await {
            log::warn!("data hook failed for {}: {err:#}", self.peer);
            transaction.failure = Some(err.to_string());
        }
    }

    async fn finish_message(&mut self) {
        let transaction = self.transaction.take().unwrap_or_default();
        let limit = self.capabilities.max_message_size;

        let reply = if let Some(failure) = transaction.failure.clone() {
            Reply::new(550, failure)
        } else if limit.map_or(false, |limit| transaction.size > limit) {
            Reply::new(552, "Message size exceeds fixed maximum message size")
        } else {
            let sender = transaction.sender.clone();

            match self.accept_message(transaction).await {
                Ok(true) => {
                    log::info!("accepted message from <{sender}> sent by {}", self.peer);
                    Reply::new(250, "Message accepted")
                }
                Ok(false) => Reply::new(550, "Message rejected"),
                Err(err) => {
                    log::warn!("message hook failed for {}: {err:#}", self.peer);
                    Reply::new(550, err.to_string())
                }
            }
        };

        self.reply(reply);
    }

    async fn accept_message(&self, transaction: Transaction) -> HookResult<bool> {
        if !self.hooks.hooks().message_received().await? {
            return Ok(false);
        }

        match self.hooks.delivery() {
            Some(delivery) => delivery.deliver(transaction.into_envelope()).await,
            None => Ok(true),
        }
    }

    fn reset(&mut self) {
        self.reset_protocol_state();
        self.reply(Reply::new(250, "Ok"));
    }

    /// Abandon any transaction and authentication, keeping HELO and TLS
    fn reset_protocol_state(&mut self) {
        self.state.reset();
        self.transaction = None;
        self.login.clear();
    }

    fn quit(&mut self) {
        self.state.quit = true;
        let text = format!("{} closing connection", self.hooks.domain());
        self.reply(Reply::new(221, text));
    }

    fn help(&mut self) {
        let commands = self.capabilities.commands().join(" ");
        self.reply(Reply::multiline(214, [Cow::Borrowed("Commands supported:"), commands.into()]));
    }

    fn unknown(&mut self) {
        self.reply(Reply::new(500, "Unrecognized command"));
    }
}

fn strip_caseless<'a>(text: &'a str, prefix: &str) -> &'a str {
    match text.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => text[prefix.len()..].trim_start(),
        _ => text,
    }
}

fn trim_ascii(mut line: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = line {
        if !first.is_ascii_whitespace() {
            break;
        }
        line = rest;
    }
    while let [rest @ .., last] = line {
        if !last.is_ascii_whitespace() {
            break;
        }
        line = rest;
    }
    line
}

fn is_hostname_like(domain: &str) -> bool {
    domain.bytes().any(|c| c.is_ascii_alphanumeric() || matches!(c, b'_' | b'.' | b'-'))
}

/// Split a MAIL or RCPT argument into its path and ESMTP parameters
fn split_path(argument: Option<&str>) -> Option<(&str, &str)> {
    let argument = argument?.trim();

    if argument.is_empty() {
        return None;
    }

    Some(match argument.split_once(|c: char| c.is_ascii_whitespace()) {
        Some((path, parameters)) => (path, parameters.trim_start()),
        None => (argument, ""),
    })
}

/// Value of the SIZE parameter of MAIL, `Err` if it isn't a number
fn declared_size(parameters: &str) -> Result<Option<usize>, ()> {
    for parameter in parameters.split_ascii_whitespace() {
        if let Some(value) = parameter.get(..5)
            .filter(|keyword| keyword.eq_ignore_ascii_case("SIZE="))
            .map(|_| &parameter[5..])
        {
            return value.parse().map(Some).map_err(|_| ());
        }
    }

    Ok(None)
}

/// Remove one pair of enclosing angle brackets
fn unbracket(path: &str) -> &str {
    path.strip_prefix('<')
        .and_then(|path| path.strip_suffix('>'))
        .unwrap_or(path)
}
