//! Cloud core primitives
//!
//! Types shared by every cloud-side controller: the message envelope exchanged with edge nodes,
//! the resource-path grammar used to route those messages, the in-process module bus, the
//! `Application` envelope used by the dynamic controller, and the process configuration.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod application;
pub mod bus;
pub mod config;
pub mod message;
pub mod modules;
pub mod resource;

pub use self::{
    application::{
        Application, ApplicationError, ApplicationStatus, Gvr, PatchInfo, StatusError, Verb,
    },
    bus::{Bus, BusError, BusMetrics, Inbox, MessageLayer},
    config::Config,
    message::{Message, Operation},
    resource::ResourceError,
};
