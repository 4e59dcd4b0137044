// Copyright 2022 OpenStax Poland
// Licensed under the MIT license. See LICENSE file in the project root for
// full license text.

//! Server side of [RFC 5321](https://datatracker.ietf.org/doc/html/rfc5321)

pub mod connection;
pub mod hooks;
pub mod proto;
pub mod reply;
pub mod server;
pub mod session;
pub mod transport;
