#![allow(clippy::tabs_in_doc_comments)]
//! An asynchronous MQTT 3.1.1 client runtime.
//!
//! A single actor task owns the connection state exclusively; every other
//! handle ([`Client`], [`Subscription`]) talks to it over a command
//! channel. QoS 2 publish is not implemented — see [`QoS`].
mod client;
mod command;
pub mod config;
mod error;
mod filter;
mod misc;
mod operation;
mod qos;
mod retry;
mod state;
mod subscription;
mod subscriptions;
mod task;
mod topic;
pub mod transport;
pub mod wire;

pub use self::{
	client::Client,
	command::Message,
	error::{Error, Result},
	filter::{Filter, FilterBuf, InvalidFilter},
	qos::{InvalidQoS, QoS},
	subscription::Subscription,
	topic::{InvalidTopic, Topic, TopicBuf},
	wire::{Codec, Packet, PacketType, StandardCodec},
};

/// An MQTT packet identifier: SUBSCRIBE, UNSUBSCRIBE, and QoS >= 1 PUBLISH
/// packets are each tagged with one, shared across all three kinds (see
/// [`operation::IdGenerator`]).
pub type PacketId = core::num::NonZeroU16;
