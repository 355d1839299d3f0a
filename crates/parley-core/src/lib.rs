// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Session runtime for parley
//!
//! This crate keeps a logical conversation alive across transport
//! reconnects. A [`Dispatcher`] reacts to inbound transport events, resolves
//! the [`Session`] through the [`SessionRegistry`], binds a task-scoped
//! [`Context`] for the duration of the reaction and invokes the user supplied
//! [`Hooks`]. Handler code talks back to the client through the
//! [`Emitter`] found on the bound context.
//!
//! Cancellation is cooperative: a stop request only raises a flag, and the
//! next `push`/`ask_and_wait` performed by the running handler fails with
//! [`SessionError::Interrupted`].

pub mod auth;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod emitter;
pub mod error;
pub mod event;
pub mod hooks;
pub mod message;
pub mod persistence;
pub mod registry;
pub mod session;
pub mod user_session;

pub use auth::{Authenticator, User};
pub use config::ProjectConfig;
pub use context::{Context, current};
pub use dispatcher::{ConnectOutcome, ConnectRequest, Dispatcher, DispatcherBuilder};
pub use emitter::{DuplexEmitter, Emitter, PlainEmitter};
pub use error::{SessionError, SessionResult, is_interrupted};
pub use event::InboundEvent;
pub use hooks::Hooks;
pub use message::{
    Action, AskFile, AskFileResponse, AskResponse, AskSpec, AskUser, FileSpec, Message,
};
pub use persistence::{ConversationClient, InMemoryConversationClient};
pub use registry::SessionRegistry;
pub use session::{ClientLink, Session, SessionKind};
pub use user_session::UserSessionStore;
