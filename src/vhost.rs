/*
 * Copyright (C) 2025-2026 Aerys Contributors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::pipeline::{Middleware, Responder};
use std::collections::HashMap;
use std::rc::Rc;

// one virtual host: a name, the middleware chain, and the terminal
// responder
pub struct Vhost {
    name: String,
    middlewares: Rc<Vec<Rc<dyn Middleware>>>,
    responder: Rc<dyn Responder>,
}

impl Vhost {
    pub fn new(name: &str, responder: Rc<dyn Responder>) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            middlewares: Rc::new(Vec::new()),
            responder,
        }
    }

    pub fn with_middlewares(name: &str, middlewares: Vec<Rc<dyn Middleware>>, responder: Rc<dyn Responder>) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            middlewares: Rc::new(middlewares),
            responder,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn middlewares(&self) -> Rc<Vec<Rc<dyn Middleware>>> {
        Rc::clone(&self.middlewares)
    }

    pub fn responder(&self) -> Rc<dyn Responder> {
        Rc::clone(&self.responder)
    }
}

// host demultiplexer. selection works on the name the client supplied
// (sni during the handshake, then the Host header); unmatched names
// fall back to the default host when one is configured
#[derive(Default)]
pub struct VhostContainer {
    hosts: HashMap<String, Rc<Vhost>>,
    default: Option<Rc<Vhost>>,
}

impl VhostContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, vhost: Vhost) {
        let vhost = Rc::new(vhost);

        if self.default.is_none() {
            self.default = Some(Rc::clone(&vhost));
        }

        self.hosts.insert(vhost.name().to_string(), vhost);
    }

    pub fn set_default(&mut self, name: &str) -> bool {
        match self.hosts.get(&name.to_ascii_lowercase()) {
            Some(vhost) => {
                self.default = Some(Rc::clone(vhost));

                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn select(&self, host: &str) -> Option<Rc<Vhost>> {
        // the port part of an authority does not participate in
        // selection
        let name = host.split(':').next().unwrap_or("").to_ascii_lowercase();

        match self.hosts.get(&name) {
            Some(vhost) => Some(Rc::clone(vhost)),
            None => self.default.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::HandlerFuture;
    use crate::request::Request;
    use crate::response::Response;

    struct NullResponder;

    impl Responder for NullResponder {
        fn respond(&self, _req: Request, _resp: Response) -> HandlerFuture {
            Box::pin(async { Ok(()) })
        }
    }

    #[test]
    fn test_select() {
        let mut vhosts = VhostContainer::new();

        vhosts.add(Vhost::new("example.com", Rc::new(NullResponder)));
        vhosts.add(Vhost::new("Other.Example", Rc::new(NullResponder)));

        assert_eq!(vhosts.len(), 2);

        assert_eq!(
            vhosts.select("example.com").unwrap().name(),
            "example.com"
        );
        assert_eq!(
            vhosts.select("EXAMPLE.COM:8080").unwrap().name(),
            "example.com"
        );
        assert_eq!(
            vhosts.select("other.example").unwrap().name(),
            "other.example"
        );

        // unknown hosts fall back to the first-added default
        assert_eq!(
            vhosts.select("unknown.example").unwrap().name(),
            "example.com"
        );

        assert!(vhosts.set_default("other.example"));
        assert_eq!(
            vhosts.select("unknown.example").unwrap().name(),
            "other.example"
        );

        assert!(!vhosts.set_default("missing.example"));
    }
}
