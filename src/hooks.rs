/// Ordered observer chain for close notification.
///
/// User-visible observers fire in registration order. The finalizer slot is
/// reserved for the owner's teardown logic and always fires after every
/// observer, no matter when it was installed. Observers therefore always see
/// a still-valid object.
pub struct HookChain<F> {
    observers: Vec<F>,
    finalizer: Option<F>,
}

impl<F> HookChain<F> {
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
            finalizer: None,
        }
    }

    /// Append a user-visible observer.
    pub fn add(&mut self, hook: F) {
        self.observers.push(hook);
    }

    /// Install the finalizer. Installed once at construction; a repeated
    /// call replaces the previous finalizer.
    pub fn set_finalizer(&mut self, hook: F) {
        self.finalizer = Some(hook);
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty() && self.finalizer.is_none()
    }

    /// Consume the chain in delivery order: observers first, finalizer last.
    pub fn drain(&mut self) -> impl Iterator<Item = F> {
        let observers = std::mem::take(&mut self.observers);
        let finalizer = self.finalizer.take();
        observers.into_iter().chain(finalizer)
    }
}

impl<F> Default for HookChain<F> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalizer_fires_last_regardless_of_install_order() {
        let mut chain: HookChain<Box<dyn FnMut(&mut Vec<&'static str>)>> = HookChain::new();

        // Finalizer installed before any observer, as the lifecycle does.
        chain.set_finalizer(Box::new(|log| log.push("finalizer")));
        chain.add(Box::new(|log| log.push("first")));
        chain.add(Box::new(|log| log.push("second")));

        let mut log = Vec::new();
        for mut hook in chain.drain() {
            hook(&mut log);
        }

        assert_eq!(log, vec!["first", "second", "finalizer"]);
        assert!(chain.is_empty());
    }

    #[test]
    fn drain_consumes_the_chain() {
        let mut chain: HookChain<Box<dyn FnMut(&mut Vec<u32>)>> = HookChain::new();
        chain.add(Box::new(|log| log.push(1)));

        let mut log = Vec::new();
        for mut hook in chain.drain() {
            hook(&mut log);
        }
        assert_eq!(log, vec![1]);

        // A second drain delivers nothing.
        assert_eq!(chain.drain().count(), 0);
    }
}
