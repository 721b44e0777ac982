//! Текстовый протокол брокера: разбор входящего потока, JSON-рукопожатия и
//! кодирование исходящих строк.

pub mod encoder;
pub mod info;
pub mod op;
pub mod parser;

pub use encoder::*;
pub use info::{parse_json, ClientConnect, RouteConnect, RouteInfo, ServerInfo};
pub use op::{Op, RoutedMessage};
pub use parser::{ParseState, Parser, DEFAULT_MAX_CONTROL_LINE};
