use std::io::{self, Write};
use std::sync::{Arc, OnceLock};

use regex::Regex;

use trace_core::{MergedStackTree, StackNode};

use crate::stream::{ByteStream, TARGET_CHUNK_SIZE};

// method names woven with a metric marker encode the metric name between the
// marker infix and a trailing disambiguation counter
static METRIC_MARKER: OnceLock<Regex> = OnceLock::new();

fn metric_marker() -> &'static Regex {
    METRIC_MARKER.get_or_init(|| {
        Regex::new(r"^.*\$informant\$metric\$(.*)\$[0-9]+$").expect("failed creating regex")
    })
}

pub(crate) fn metric_marker_name(symbol: &str) -> Option<String> {
    metric_marker()
        .captures(symbol)
        .map(|captures| captures[1].replace('$', " "))
}

enum Token {
    Node(Arc<StackNode>),
    SyntheticRoot {
        sample_count: u64,
        children: Vec<Arc<StackNode>>,
    },
    EndObject,
    EndArray,
    PopMetricName,
}

/// Streams the merged stack tree in pre-order, driven by an explicit work
/// list so unbounded trees encode in bounded memory without recursion.
pub struct MergedStackTreeByteStream {
    to_visit: Vec<Token>,
    metric_name_stack: Vec<String>,
    buf: Vec<u8>,
    last: u8,
}

impl MergedStackTreeByteStream {
    /// None when the tree holds no samples. A single top-level node becomes
    /// the document root; multiple distinct top frames are grouped under a
    /// synthetic root.
    pub(crate) fn from_tree(tree: &MergedStackTree) -> Option<Self> {
        let mut roots = tree.root_nodes();
        if roots.is_empty() {
            return None;
        }
        let token = if roots.len() == 1 {
            Token::Node(roots.remove(0))
        } else {
            Token::SyntheticRoot {
                sample_count: roots.iter().map(|r| r.sample_count()).sum(),
                children: roots,
            }
        };
        Some(MergedStackTreeByteStream {
            to_visit: vec![token],
            metric_name_stack: Vec::new(),
            buf: Vec::new(),
            last: 0,
        })
    }

    fn write_next(&mut self) -> io::Result<()> {
        let Some(token) = self.to_visit.pop() else {
            return Ok(());
        };
        match token {
            Token::Node(node) => self.write_node(&node)?,
            Token::SyntheticRoot {
                sample_count,
                children,
            } => {
                if self.last == b'}' {
                    self.buf.push(b',');
                }
                write!(
                    self.buf,
                    "{{\"stackTraceElement\":\"<multiple root nodes>\",\"sampleCount\":{},\"childNodes\":[",
                    sample_count
                )?;
                self.to_visit.push(Token::EndObject);
                self.to_visit.push(Token::EndArray);
                self.to_visit
                    .extend(children.into_iter().rev().map(Token::Node));
            }
            Token::EndObject => self.buf.push(b'}'),
            Token::EndArray => self.buf.push(b']'),
            Token::PopMetricName => {
                self.metric_name_stack.pop();
            }
        }
        if let Some(&byte) = self.buf.last() {
            self.last = byte;
        }
        Ok(())
    }

    fn write_node(&mut self, node: &Arc<StackNode>) -> io::Result<()> {
        if self.last == b'}' {
            // sibling separator, the previous node just closed
            self.buf.push(b',');
        }
        self.buf.extend_from_slice(b"{\"stackTraceElement\":");
        serde_json::to_writer(&mut self.buf, &node.frame().to_string())
            .map_err(io::Error::from)?;
        self.to_visit.push(Token::EndObject);
        if let Some(name) = metric_marker_name(node.frame().symbol()) {
            // successive duplicates are common from weaving groups of
            // overloaded methods, keep only the first
            if self.metric_name_stack.last() != Some(&name) {
                self.metric_name_stack.push(name);
                self.to_visit.push(Token::PopMetricName);
            }
        }
        write!(self.buf, ",\"sampleCount\":{}", node.sample_count())?;
        let children = node.children();
        if children.is_empty() {
            if let Some(state) = node.leaf_thread_state() {
                write!(self.buf, ",\"leafThreadState\":\"{}\"", state.name())?;
            }
            if !self.metric_name_stack.is_empty() {
                self.buf.extend_from_slice(b",\"metricNames\":");
                serde_json::to_writer(&mut self.buf, &self.metric_name_stack)
                    .map_err(io::Error::from)?;
            }
        } else {
            self.buf.extend_from_slice(b",\"childNodes\":[");
            self.to_visit.push(Token::EndArray);
            self.to_visit
                .extend(children.into_iter().rev().map(Token::Node));
        }
        Ok(())
    }
}

impl ByteStream for MergedStackTreeByteStream {
    fn has_next(&self) -> bool {
        !self.to_visit.is_empty() || !self.buf.is_empty()
    }

    fn next(&mut self) -> io::Result<Vec<u8>> {
        while self.buf.len() < TARGET_CHUNK_SIZE && !self.to_visit.is_empty() {
            self.write_next()?;
        }
        Ok(std::mem::take(&mut self.buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trace_core::{StackFrame, ThreadSnapshot, ThreadState};

    #[test]
    fn test_metric_marker_name() {
        assert_eq!(
            metric_marker_name("execute$informant$metric$jdbc$query$42"),
            Some("jdbc query".to_string())
        );
        assert_eq!(metric_marker_name("execute"), None);
        assert_eq!(metric_marker_name("execute$informant$metric$x"), None);
    }

    fn tree_of(samples: &[&[&str]]) -> MergedStackTree {
        let tree = MergedStackTree::new();
        for frames in samples {
            // innermost first
            tree.add_stack_trace(&ThreadSnapshot::new(
                ThreadState::Runnable,
                frames.iter().map(|f| StackFrame::new(*f)).collect(),
            ));
        }
        tree
    }

    fn encode(tree: &MergedStackTree) -> serde_json::Value {
        let mut stream = MergedStackTreeByteStream::from_tree(tree).expect("non-empty tree");
        let bytes = stream.collect().unwrap();
        serde_json::from_slice(&bytes).expect("valid json")
    }

    #[test]
    fn test_empty_tree_has_no_stream() {
        assert!(MergedStackTreeByteStream::from_tree(&MergedStackTree::new()).is_none());
    }

    #[test]
    fn test_single_root_document() {
        let tree = tree_of(&[&["h", "g", "f"], &["h", "g", "f"], &["k", "g", "f"]]);
        let doc = encode(&tree);
        assert_eq!(doc["stackTraceElement"], "f");
        assert_eq!(doc["sampleCount"], 3);
        let g = &doc["childNodes"][0];
        assert_eq!(g["sampleCount"], 3);
        let leaves = g["childNodes"].as_array().unwrap();
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[0]["stackTraceElement"], "h");
        assert_eq!(leaves[0]["sampleCount"], 2);
        assert_eq!(leaves[0]["leafThreadState"], "RUNNABLE");
        assert_eq!(leaves[1]["stackTraceElement"], "k");
        assert_eq!(leaves[1]["sampleCount"], 1);
    }

    #[test]
    fn test_synthetic_root_for_multiple_top_frames() {
        let tree = tree_of(&[&["a", "main"], &["b", "run"]]);
        let doc = encode(&tree);
        assert_eq!(doc["stackTraceElement"], "<multiple root nodes>");
        assert_eq!(doc["sampleCount"], 2);
        let children = doc["childNodes"].as_array().unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0]["stackTraceElement"], "main");
        assert_eq!(children[1]["stackTraceElement"], "run");
    }

    #[test]
    fn test_metric_names_in_scope_on_leaf() {
        let tree = tree_of(&[&[
            "read",
            "query$informant$metric$jdbc$query$7",
            "handle$informant$metric$http$request$1",
            "main",
        ]]);
        let doc = encode(&tree);
        let leaf = &doc["childNodes"][0]["childNodes"][0]["childNodes"][0];
        assert_eq!(leaf["stackTraceElement"], "read");
        assert_eq!(
            leaf["metricNames"],
            serde_json::json!(["http request", "jdbc query"])
        );
    }

    #[test]
    fn test_successive_duplicate_markers_filtered() {
        let tree = tree_of(&[&[
            "query$informant$metric$jdbc$query$8",
            "query$informant$metric$jdbc$query$7",
            "main",
        ]]);
        let doc = encode(&tree);
        let leaf = &doc["childNodes"][0]["childNodes"][0];
        assert_eq!(leaf["metricNames"], serde_json::json!(["jdbc query"]));
    }
}
