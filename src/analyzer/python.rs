//! What the analyzer knows about Python itself.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Top-level modules of the CPython standard library.
const STDLIB: &[&str] = &[
    "__future__", "_thread", "abc", "argparse", "array", "ast", "asyncio", "atexit", "base64",
    "bdb", "binascii", "bisect", "builtins", "bz2", "calendar", "cmath", "cmd", "code", "codecs",
    "collections", "colorsys", "compileall", "concurrent", "configparser", "contextlib",
    "contextvars", "copy", "copyreg", "cProfile", "csv", "ctypes", "curses", "dataclasses",
    "datetime", "dbm", "decimal", "difflib", "dis", "doctest", "email", "encodings", "enum",
    "errno", "faulthandler", "fcntl", "filecmp", "fileinput", "fnmatch", "fractions", "ftplib",
    "functools", "gc", "getopt", "getpass", "gettext", "glob", "graphlib", "grp", "gzip",
    "hashlib", "heapq", "hmac", "html", "http", "imaplib", "importlib", "inspect", "io",
    "ipaddress", "itertools", "json", "keyword", "linecache", "locale", "logging", "lzma",
    "mailbox", "marshal", "math", "mimetypes", "mmap", "multiprocessing", "netrc", "numbers",
    "operator", "optparse", "os", "pathlib", "pdb", "pickle", "pickletools", "pkgutil",
    "platform", "plistlib", "poplib", "posix", "pprint", "profile", "pstats", "pty", "pwd",
    "py_compile", "pyclbr", "pydoc", "queue", "quopri", "random", "re", "readline", "reprlib",
    "resource", "rlcompleter", "runpy", "sched", "secrets", "select", "selectors", "shelve",
    "shlex", "shutil", "signal", "site", "smtplib", "socket", "socketserver", "sqlite3", "ssl",
    "stat", "statistics", "string", "stringprep", "struct", "subprocess", "symtable", "sys",
    "sysconfig", "syslog", "tabnanny", "tarfile", "tempfile", "termios", "textwrap", "threading",
    "time", "timeit", "tkinter", "token", "tokenize", "tomllib", "trace", "traceback",
    "tracemalloc", "tty", "turtle", "types", "typing", "unicodedata", "unittest", "urllib",
    "uuid", "venv", "warnings", "wave", "weakref", "webbrowser", "wsgiref", "xml", "xmlrpc",
    "zipapp", "zipfile", "zipimport", "zlib", "zoneinfo",
];

const BUILTINS: &[&str] = &[
    "__build_class__", "__debug__", "__doc__", "__file__", "__import__", "__name__",
    "__spec__", "abs", "aiter", "all", "anext", "any", "ascii", "bin", "bool", "breakpoint",
    "bytearray", "bytes", "callable", "chr", "classmethod", "compile", "complex", "copyright",
    "delattr", "dict", "dir", "divmod", "enumerate", "eval", "exec", "exit", "filter", "float",
    "format", "frozenset", "getattr", "globals", "hasattr", "hash", "help", "hex", "id", "input",
    "int", "isinstance", "issubclass", "iter", "len", "list", "locals", "map", "max",
    "memoryview", "min", "next", "object", "oct", "open", "ord", "pow", "print", "property",
    "quit", "range", "repr", "reversed", "round", "set", "setattr", "slice", "sorted",
    "staticmethod", "str", "sum", "super", "tuple", "type", "vars", "zip",
    "NotImplemented", "Ellipsis", "BaseException", "BaseExceptionGroup", "Exception",
    "ExceptionGroup", "ArithmeticError", "AssertionError", "AttributeError", "BlockingIOError",
    "BrokenPipeError", "BufferError", "ChildProcessError", "ConnectionAbortedError",
    "ConnectionError", "ConnectionRefusedError", "ConnectionResetError", "EOFError",
    "EnvironmentError", "FileExistsError", "FileNotFoundError", "FloatingPointError",
    "GeneratorExit", "IOError", "ImportError", "IndentationError", "IndexError",
    "InterruptedError", "IsADirectoryError", "KeyError", "KeyboardInterrupt", "LookupError",
    "MemoryError", "ModuleNotFoundError", "NameError", "NotADirectoryError",
    "NotImplementedError", "OSError", "OverflowError", "PermissionError", "ProcessLookupError",
    "RecursionError", "ReferenceError", "RuntimeError", "StopAsyncIteration", "StopIteration",
    "SyntaxError", "SystemError", "SystemExit", "TabError", "TimeoutError", "TypeError",
    "UnboundLocalError", "UnicodeDecodeError", "UnicodeEncodeError", "UnicodeError",
    "ValueError", "ZeroDivisionError", "Warning", "UserWarning", "DeprecationWarning",
    "RuntimeWarning", "FutureWarning", "ResourceWarning",
];

/// Import names whose distribution is published under another name.
const PIP_ALIASES: &[(&str, &str)] = &[
    ("Crypto", "pycryptodome"),
    ("OpenSSL", "pyOpenSSL"),
    ("PIL", "Pillow"),
    ("attr", "attrs"),
    ("bs4", "beautifulsoup4"),
    ("cv2", "opencv-python"),
    ("dateutil", "python-dateutil"),
    ("dotenv", "python-dotenv"),
    ("jwt", "PyJWT"),
    ("magic", "python-magic"),
    ("serial", "pyserial"),
    ("skimage", "scikit-image"),
    ("sklearn", "scikit-learn"),
    ("yaml", "PyYAML"),
    ("zmq", "pyzmq"),
];

pub fn is_stdlib(module: &str) -> bool {
    STDLIB.contains(&module)
}

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

/// Distribution name for a top-level import name.
pub fn distribution(module: &str) -> &str {
    PIP_ALIASES
        .iter()
        .find(|(import, _)| *import == module)
        .map_or(module, |(_, dist)| dist)
}

fn normalize(name: &str) -> String {
    name.to_ascii_lowercase().replace('_', "-").replace('.', "-")
}

/// A third-party distribution to install, with an optional pip constraint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Requirement {
    pub package: String,
    pub constraint: Option<String>,
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{}", self.package, self.constraint.as_deref().unwrap_or(""))
    }
}

/// Pins read from a `requirements.txt`, keyed by normalized name.
#[derive(Debug, Default)]
pub struct Pins {
    pins: HashMap<String, Requirement>,
}

impl Pins {
    pub fn parse(text: &str) -> Self {
        let mut pins = HashMap::new();
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() || line.starts_with('-') {
                continue;
            }
            let line = line.split(';').next().unwrap_or("").trim();
            let name_end = line
                .find(|c: char| !(c.is_ascii_alphanumeric() || "-_.".contains(c)))
                .unwrap_or(line.len());
            let package = &line[..name_end];
            let mut rest = line[name_end..].trim();
            if rest.starts_with('[') {
                rest = rest.find(']').map_or("", |i| rest[i + 1..].trim());
            }
            if package.is_empty() {
                continue;
            }
            let constraint = (!rest.is_empty()).then(|| rest.replace(' ', ""));
            pins.insert(
                normalize(package),
                Requirement {
                    package: package.to_string(),
                    constraint,
                },
            );
        }
        Self { pins }
    }

    /// Reads `requirements.txt` in `dir`, if there is one.
    pub fn load(dir: &Path) -> Self {
        let path = dir.join("requirements.txt");
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                debug!(path = %path.display(), "Using requirement pins");
                Self::parse(&text)
            }
            Err(_) => Self::default(),
        }
    }

    /// The requirement for an import's top-level module.
    pub fn requirement(&self, module: &str) -> Requirement {
        let package = distribution(module);
        self.pins
            .get(&normalize(package))
            .cloned()
            .unwrap_or_else(|| Requirement {
                package: package.to_string(),
                constraint: None,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables() {
        assert!(is_stdlib("os"));
        assert!(is_stdlib("concurrent"));
        assert!(!is_stdlib("numpy"));
        assert!(is_builtin("len"));
        assert!(is_builtin("ValueError"));
        assert!(!is_builtin("helper"));
        assert_eq!(distribution("sklearn"), "scikit-learn");
        assert_eq!(distribution("numpy"), "numpy");
    }

    #[test]
    fn test_pins() {
        let pins = Pins::parse(
            "# data stack\nnumpy>=1.24, <2\nscikit_learn==1.3.0  # ml\nrequests[socks] ~= 2.31\n-r other.txt\npandas\n",
        );
        assert_eq!(pins.requirement("numpy").to_string(), "numpy>=1.24,<2");
        assert_eq!(
            pins.requirement("sklearn").to_string(),
            "scikit_learn==1.3.0"
        );
        assert_eq!(pins.requirement("requests").to_string(), "requests~=2.31");
        assert_eq!(pins.requirement("pandas").constraint, None);
        assert_eq!(pins.requirement("torch").to_string(), "torch");
    }
}
