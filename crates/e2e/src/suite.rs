//! Suite descriptors handed from the loader to the BDD engine

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};

/// What a running test or hook knows about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestContext {
    pub title: String,
    /// Ancestor suite titles and the test title, space separated
    pub full_title: String,
}

/// Body of a test or hook
pub type TestFn = Arc<dyn Fn(TestContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`TestFn`]
pub fn test_fn<F, Fut>(body: F) -> TestFn
where
    F: Fn(TestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| body(ctx).boxed())
}

#[derive(Clone)]
pub struct Test {
    pub title: String,
    /// `None` marks a pending test
    pub body: Option<TestFn>,
    pub file: Option<PathBuf>,
}

impl Test {
    pub fn is_pending(&self) -> bool {
        self.body.is_none()
    }
}

impl fmt::Debug for Test {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Test")
            .field("title", &self.title)
            .field("pending", &self.is_pending())
            .field("file", &self.file)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Before,
    After,
    BeforeEach,
    AfterEach,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HookKind::Before => "before all",
            HookKind::After => "after all",
            HookKind::BeforeEach => "before each",
            HookKind::AfterEach => "after each",
        })
    }
}

#[derive(Clone)]
pub struct Hook {
    pub title: String,
    pub body: TestFn,
}

impl Hook {
    pub fn new(title: impl Into<String>, body: TestFn) -> Self {
        Self {
            title: title.into(),
            body,
        }
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook").field("title", &self.title).finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Hooks {
    pub before: Vec<Hook>,
    pub after: Vec<Hook>,
    pub before_each: Vec<Hook>,
    pub after_each: Vec<Hook>,
}

impl Hooks {
    pub fn of(&self, kind: HookKind) -> &[Hook] {
        match kind {
            HookKind::Before => &self.before,
            HookKind::After => &self.after,
            HookKind::BeforeEach => &self.before_each,
            HookKind::AfterEach => &self.after_each,
        }
    }

    pub fn push(&mut self, kind: HookKind, hook: Hook) {
        match kind {
            HookKind::Before => self.before.push(hook),
            HookKind::After => self.after.push(hook),
            HookKind::BeforeEach => self.before_each.push(hook),
            HookKind::AfterEach => self.after_each.push(hook),
        }
    }
}

/// A suite child, kept in declaration order
#[derive(Debug, Clone)]
pub enum Node {
    Test(Test),
    Suite(Suite),
}

#[derive(Debug, Clone, Default)]
pub struct Suite {
    pub title: String,
    pub file: Option<PathBuf>,
    pub hooks: Hooks,
    pub children: Vec<Node>,
}

impl Suite {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// The untitled suite the runner hands to the engine
    pub fn root() -> Self {
        Self::default()
    }

    pub fn is_root(&self) -> bool {
        self.title.is_empty()
    }

    pub fn add_test(&mut self, test: Test) {
        self.children.push(Node::Test(test));
    }

    pub fn add_suite(&mut self, suite: Suite) {
        self.children.push(Node::Suite(suite));
    }

    /// Direct child suites
    pub fn suites(&self) -> impl Iterator<Item = &Suite> {
        self.children.iter().filter_map(|node| match node {
            Node::Suite(suite) => Some(suite),
            Node::Test(_) => None,
        })
    }

    /// Direct child tests
    pub fn tests(&self) -> impl Iterator<Item = &Test> {
        self.children.iter().filter_map(|node| match node {
            Node::Test(test) => Some(test),
            Node::Suite(_) => None,
        })
    }

    /// Tests in this suite and every nested suite
    pub fn test_count(&self) -> usize {
        self.children
            .iter()
            .map(|node| match node {
                Node::Test(_) => 1,
                Node::Suite(suite) => suite.test_count(),
            })
            .sum()
    }

    /// Full titles of every test, depth first in declaration order
    pub fn full_titles(&self) -> Vec<String> {
        let mut titles = Vec::new();
        self.collect_titles(&[], &mut titles);
        titles
    }

    fn collect_titles(&self, parents: &[String], out: &mut Vec<String>) {
        let path = extend_path(parents, &self.title);
        for node in &self.children {
            match node {
                Node::Test(test) => out.push(full_title(&path, &test.title)),
                Node::Suite(suite) => suite.collect_titles(&path, out),
            }
        }
    }
}

/// Append a suite title to its ancestors; untitled suites add nothing
pub(crate) fn extend_path(parents: &[String], title: &str) -> Vec<String> {
    let mut path = parents.to_vec();
    if !title.is_empty() {
        path.push(title.to_string());
    }
    path
}

pub(crate) fn full_title(path: &[String], title: &str) -> String {
    let mut parts: Vec<&str> = path.iter().map(String::as_str).collect();
    parts.push(title);
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn noop() -> TestFn {
        test_fn(|_| async { Ok(()) })
    }

    #[test]
    fn test_full_titles_skip_root() {
        let mut inner = Suite::new("login");
        inner.add_test(Test {
            title: "accepts valid credentials".into(),
            body: Some(noop()),
            file: None,
        });
        let mut outer = Suite::new("security");
        outer.add_suite(inner);
        outer.add_test(Test {
            title: "shows banner".into(),
            body: None,
            file: None,
        });
        let mut root = Suite::root();
        root.add_suite(outer);

        assert_eq!(
            root.full_titles(),
            vec!["security login accepts valid credentials", "security shows banner"]
        );
        assert_eq!(root.test_count(), 2);
        assert_eq!(root.suites().count(), 1);
    }

    #[test]
    fn test_hooks_by_kind() {
        let mut hooks = Hooks::default();
        hooks.push(HookKind::BeforeEach, Hook::new("reset", noop()));
        assert_eq!(hooks.of(HookKind::BeforeEach).len(), 1);
        assert!(hooks.of(HookKind::After).is_empty());
        assert_eq!(HookKind::BeforeEach.to_string(), "before each");
    }

    #[test_case(&[], "login", "login" ; "top level")]
    #[test_case(&["security"], "login", "security login" ; "nested once")]
    #[test_case(&["", "security"], "login", "security login" ; "root title skipped")]
    fn test_full_title(suites: &[&str], title: &str, expected: &str) {
        let path = suites.iter().fold(Vec::new(), |path, suite| extend_path(&path, suite));
        assert_eq!(full_title(&path, title), expected);
    }
}
