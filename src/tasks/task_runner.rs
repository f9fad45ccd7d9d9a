use tokio::task::JoinHandle;

/// Collects long-running loops and starts them together. The returned
/// handles are what shutdown aborts.
pub struct TaskRunner {
    tasks: Vec<(String, Box<dyn FnOnce() -> JoinHandle<()> + Send>)>,
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRunner {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    pub fn add_task<F>(&mut self, name: impl Into<String>, task: F)
    where
        F: FnOnce() -> JoinHandle<()> + Send + 'static,
    {
        self.tasks.push((name.into(), Box::new(task)));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn start_all(self) -> Vec<(String, JoinHandle<()>)> {
        self.tasks
            .into_iter()
            .map(|(name, task)| (name, task()))
            .collect()
    }
}
