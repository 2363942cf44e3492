//! Synchronous observer lists.
//!
//! A [`Subject`] holds the listeners for one kind of event. Listeners run synchronously,
//! in registration order, every time the subject dispatches. The same closure may be
//! registered more than once and will then run once per registration.

/// Listener callback for payloads of type `T`.
pub type Listener<T> = Box<dyn FnMut(&T) + Send>;

/// Ordered list of listeners for one event kind.
pub struct Subject<T: ?Sized> {
    listeners: Vec<Listener<T>>,
}

impl<T: ?Sized> Subject<T> {
    /// Create a subject with no listeners.
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    /// Register a listener. It runs after every previously registered listener.
    pub fn subscribe<F>(&mut self, listener: F)
    where
        F: FnMut(&T) + Send + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    /// Invoke every listener with `payload`.
    pub fn dispatch(&mut self, payload: &T) {
        for listener in &mut self.listeners {
            listener(payload);
        }
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Whether no listeners are registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl<T: ?Sized> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> std::fmt::Debug for Subject<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subject")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
