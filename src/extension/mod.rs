// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Websocket [extensions][ext] and their negotiation.
//!
//! * `identity` - a no-op extension, always available.
//! * `permessage-deflate` - enable via the `deflate` feature.
//!
//! [ext]: https://tools.ietf.org/html/rfc6455#section-9

#[cfg(feature = "deflate")]
pub mod deflate;
pub mod identity;

use crate::{BoxedError, base::Frame, util};
use log::{debug, warn};
use smallvec::SmallVec;
use std::{borrow::Cow, fmt};

/// A websocket extension as per RFC 6455, section 9.
///
/// An extension sits in both frame pipelines of a connection: it sees
/// every outgoing frame through [`Extension::encode`] and every incoming
/// frame through [`Extension::decode`].
pub trait Extension: fmt::Debug + Send {
    /// The name of this extension.
    fn name(&self) -> &str;

    /// The parameters this extension wants to send for negotiation.
    fn params(&self) -> &[Param];

    /// Configure this extension with the parameters received from negotiation.
    fn configure(&mut self, params: &[Param]) -> Result<(), BoxedError>;

    /// Encode the given outgoing frame.
    fn encode(&mut self, frame: &mut Frame) -> Result<(), BoxedError>;

    /// Decode the given incoming frame.
    fn decode(&mut self, frame: &mut Frame) -> Result<(), BoxedError>;

    /// The reserved bits this extension uses, as `(rsv1, rsv2, rsv3)`.
    fn reserved_bits(&self) -> (bool, bool, bool) {
        (false, false, false)
    }
}

impl<E: Extension + ?Sized> Extension for Box<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn params(&self) -> &[Param] {
        (**self).params()
    }

    fn configure(&mut self, params: &[Param]) -> Result<(), BoxedError> {
        (**self).configure(params)
    }

    fn encode(&mut self, frame: &mut Frame) -> Result<(), BoxedError> {
        (**self).encode(frame)
    }

    fn decode(&mut self, frame: &mut Frame) -> Result<(), BoxedError> {
        (**self).decode(frame)
    }

    fn reserved_bits(&self) -> (bool, bool, bool) {
        (**self).reserved_bits()
    }
}

// Param //////////////////////////////////////////////////////////////////////////////////////////

/// Extension parameter (used for negotiation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param<'a> {
    name: Cow<'a, str>,
    value: Option<Cow<'a, str>>
}

impl<'a> fmt::Display for Param<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(v) = &self.value {
            write!(f, "{}={}", self.name, util::quote_if_needed(v))
        } else {
            write!(f, "{}", self.name)
        }
    }
}

impl<'a> Param<'a> {
    /// Create a new parameter with the given name.
    pub fn new(name: impl Into<Cow<'a, str>>) -> Self {
        Param {
            name: name.into(),
            value: None
        }
    }

    /// Access the parameter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Access the optional parameter value.
    pub fn value(&self) -> Option<&str> {
        self.value.as_ref().map(|v| v.as_ref())
    }

    /// Set the parameter to the given value.
    pub fn set_value(&mut self, value: Option<impl Into<Cow<'a, str>>>) -> &mut Self {
        self.value = value.map(Into::into);
        self
    }

    /// Turn this parameter into one that owns its data.
    pub fn acquire(self) -> Param<'static> {
        Param {
            name: Cow::Owned(self.name.into_owned()),
            value: self.value.map(|v| Cow::Owned(v.into_owned()))
        }
    }
}

// ExtensionConfig ////////////////////////////////////////////////////////////////////////////////

/// A single entry of a `Sec-WebSocket-Extensions` header value,
/// e.g. `permessage-deflate; client_max_window_bits=10`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionConfig {
    name: String,
    params: SmallVec<[Param<'static>; 4]>
}

impl ExtensionConfig {
    /// Create a new configuration without any parameters.
    pub fn new(name: impl Into<String>) -> Self {
        ExtensionConfig { name: name.into(), params: SmallVec::new() }
    }

    /// Create the configuration an extension wants to offer.
    pub fn offer(ext: &dyn Extension) -> Self {
        let mut config = ExtensionConfig::new(ext.name());
        for p in ext.params() {
            config.add_param(p.clone().acquire());
        }
        config
    }

    /// Parse a single (already comma-separated) header entry.
    ///
    /// Returns `None` if the entry has no extension name.
    pub fn parse(entry: &str) -> Option<Self> {
        if entry.trim_start().starts_with(';') {
            return None
        }
        let mut parts = util::split_quoted(entry, ';');
        let name = util::unquote(parts.next()?);
        if name.is_empty() {
            return None
        }
        let mut config = ExtensionConfig::new(name.into_owned());
        for part in parts {
            let mut kv = part.splitn(2, '=');
            let key = kv.next().unwrap_or("").trim();
            if key.is_empty() {
                debug!("{}: ignoring parameter without name: {:?}", config.name, part);
                continue
            }
            let mut param = Param::new(key.to_string());
            param.set_value(kv.next().map(|v| util::unquote(v).into_owned()));
            config.params.push(param)
        }
        Some(config)
    }

    /// The extension name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The extension parameters.
    pub fn params(&self) -> &[Param<'static>] {
        &self.params
    }

    /// Add a parameter.
    pub fn add_param(&mut self, p: Param<'static>) -> &mut Self {
        self.params.push(p);
        self
    }
}

impl fmt::Display for ExtensionConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.name)?;
        for p in &self.params {
            write!(f, "; {}", p)?
        }
        Ok(())
    }
}

// Registry ///////////////////////////////////////////////////////////////////////////////////////

type Factory = Box<dyn Fn() -> Box<dyn Extension> + Send + Sync>;

/// Maps extension names to factories producing fresh extension instances.
pub struct ExtensionRegistry {
    factories: Vec<(String, Factory)>
}

impl fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.factories.iter().map(|(n, _)| n)).finish()
    }
}

impl Default for ExtensionRegistry {
    /// A registry with all built-in extensions.
    fn default() -> Self {
        let mut registry = ExtensionRegistry::new();
        registry.register(identity::NAME, || Box::new(identity::Identity::new()));
        #[cfg(feature = "deflate")]
        registry.register(deflate::NAME, || Box::new(deflate::Deflate::new()));
        registry
    }
}

impl ExtensionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        ExtensionRegistry { factories: Vec::new() }
    }

    /// Register a factory for the given extension name.
    ///
    /// A factory registered earlier under the same name is replaced.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Extension> + Send + Sync + 'static
    {
        let name = name.into();
        self.factories.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.factories.push((name, Box::new(factory)));
        self
    }

    /// Is there a factory for the given extension name?
    pub fn is_registered(&self, name: &str) -> bool {
        self.factories.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Create and configure extension instances for the negotiated configurations.
    ///
    /// The order of `configs` is preserved. Configurations with an unknown name
    /// or which the extension refuses to be configured with are skipped.
    pub fn instantiate(&self, configs: &[ExtensionConfig]) -> Vec<Box<dyn Extension>> {
        let mut extensions = Vec::with_capacity(configs.len());
        for config in configs {
            let factory = self.factories.iter().find(|(n, _)| n.eq_ignore_ascii_case(config.name()));
            let Some((_, factory)) = factory else {
                warn!("no extension registered for negotiated name {:?}", config.name());
                continue
            };
            let mut ext = factory();
            if let Err(e) = ext.configure(config.params()) {
                warn!("skipping extension {}: {}", config, e);
                continue
            }
            debug!("instantiated extension {}", config);
            extensions.push(ext)
        }
        extensions
    }
}
