//! Parsing of session command lines.

use std::{io, str::FromStr};

use derive_more::Display;
use displaydoc::Display as DisplayDoc;
use thiserror::Error;

use super::{models::is_valid_name, ClientId};
use crate::codec::FrameError;

/// Errors which can occur while a request is handled.
///
/// The message of every error is sent to the client on an `ERROR <message>` line.
#[derive(Debug, DisplayDoc, Error)]
pub enum RequestError {
    /// Invalid identifier: {0}
    InvalidIdentifier(String),
    /// Unknown request type: {0}
    UnknownVerb(String),
    /// Model not found: {0}
    ModelNotFound(String),
    /// Client has not received this model: {0}
    NotGranted(String),
    /// Invalid model name: {0}
    InvalidModelName(String),
    /// Malformed request: {0}
    Malformed(&'static str),
    /// Model storage failed: {0}
    ModelStorage(#[from] io::Error),
    /// Transfer failed: {0}
    Transfer(#[from] FrameError),
}

impl RequestError {
    /// Whether the connection cannot carry further requests after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RequestError::Transfer(_))
    }
}

/// The request types.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    #[display(fmt = "GET_IDENTIFIER")]
    GetIdentifier,
    #[display(fmt = "GET_MODEL")]
    GetModel,
    #[display(fmt = "SUBMIT_PARAMS")]
    SubmitParams,
    #[display(fmt = "GET_PARAMS")]
    GetParams,
    #[display(fmt = "CLOSE")]
    Close,
}

impl Verb {
    pub const ALL: [Verb; 5] = [
        Verb::GetIdentifier,
        Verb::GetModel,
        Verb::SubmitParams,
        Verb::GetParams,
        Verb::Close,
    ];
}

impl FromStr for Verb {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Verb::ALL
            .iter()
            .copied()
            .find(|verb| verb.to_string() == s)
            .ok_or_else(|| RequestError::UnknownVerb(s.to_string()))
    }
}

/// A command line split into its tokens.
///
/// `GET_IDENTIFIER` is the only request without an identifier. Every other request has the form
/// `<id> <verb> [<argument>]`. The identifier is kept as a raw token here: whether it names a
/// registered client is decided by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine<'a> {
    Identify,
    Client {
        token: &'a str,
        verb: Option<&'a str>,
        argument: Option<&'a str>,
    },
}

impl<'a> CommandLine<'a> {
    /// Splits `line` on whitespace.
    ///
    /// # Errors
    /// Fails on an empty line or on tokens after the argument.
    pub fn parse(line: &'a str) -> Result<Self, RequestError> {
        let mut tokens = line.split_whitespace();
        let first = tokens
            .next()
            .ok_or(RequestError::Malformed("empty request"))?;
        if first == Verb::GetIdentifier.to_string() {
            return match tokens.next() {
                None => Ok(CommandLine::Identify),
                Some(_) => Err(RequestError::Malformed("unexpected arguments")),
            };
        }
        let verb = tokens.next();
        let argument = tokens.next();
        if tokens.next().is_some() {
            return Err(RequestError::Malformed("unexpected arguments"));
        }
        Ok(CommandLine::Client {
            token: first,
            verb,
            argument,
        })
    }
}

/// An authenticated request, ready to be handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub verb: Verb,
    /// The identifier of the client, absent for `GET_IDENTIFIER`.
    pub client: Option<ClientId>,
    pub argument: Option<String>,
}

impl Request {
    /// The identifier of the requesting client.
    ///
    /// # Errors
    /// Fails if the request carries no identifier.
    pub fn client(&self) -> Result<ClientId, RequestError> {
        self.client
            .ok_or(RequestError::Malformed("missing identifier"))
    }

    /// The model name argument.
    ///
    /// # Errors
    /// Fails if the argument is missing or is not a valid model name.
    pub fn model(&self) -> Result<&str, RequestError> {
        let name = self
            .argument
            .as_deref()
            .ok_or(RequestError::Malformed("missing model name"))?;
        if is_valid_name(name) {
            Ok(name)
        } else {
            Err(RequestError::InvalidModelName(name.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbs() {
        for verb in Verb::ALL.iter() {
            assert_eq!(verb.to_string().parse::<Verb>().unwrap(), *verb);
        }
        assert_eq!(Verb::SubmitParams.to_string(), "SUBMIT_PARAMS");
        let err = "PUSH".parse::<Verb>().unwrap_err();
        assert_eq!(err.to_string(), "Unknown request type: PUSH");
    }

    #[test]
    fn test_parse_command_lines() {
        assert_eq!(
            CommandLine::parse("GET_IDENTIFIER").unwrap(),
            CommandLine::Identify
        );
        assert_eq!(
            CommandLine::parse("abc GET_MODEL mnist").unwrap(),
            CommandLine::Client {
                token: "abc",
                verb: Some("GET_MODEL"),
                argument: Some("mnist"),
            }
        );
        assert_eq!(
            CommandLine::parse("abc").unwrap(),
            CommandLine::Client {
                token: "abc",
                verb: None,
                argument: None,
            }
        );
        assert!(CommandLine::parse("   ").is_err());
        assert!(CommandLine::parse("GET_IDENTIFIER now").is_err());
        assert!(CommandLine::parse("abc CLOSE all please").is_err());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            RequestError::InvalidIdentifier("xyz".into()).to_string(),
            "Invalid identifier: xyz"
        );
        assert_eq!(
            RequestError::NotGranted("mnist".into()).to_string(),
            "Client has not received this model: mnist"
        );
        assert!(RequestError::Transfer(FrameError::Disconnected).is_fatal());
        assert!(!RequestError::ModelNotFound("m".into()).is_fatal());
    }

    #[test]
    fn test_model_argument() {
        let mut request = Request {
            verb: Verb::GetModel,
            client: Some(ClientId::new()),
            argument: Some("mnist".into()),
        };
        assert_eq!(request.model().unwrap(), "mnist");

        request.argument = Some("../etc/passwd".into());
        assert!(matches!(
            request.model(),
            Err(RequestError::InvalidModelName(_))
        ));

        request.argument = None;
        assert!(matches!(request.model(), Err(RequestError::Malformed(_))));
    }
}
