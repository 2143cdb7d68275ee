//! Export documents shaped like the recorder's output, for tests.

use std::collections::HashMap;
use std::fmt::Write as _;

pub(crate) fn toc_with_tables(start_date: &str, tables: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<trace-toc>
  <run number="1">
    <info>
      <target><device platform="macOS" model="MacBook Pro" name="bench-host"/></target>
      <summary>
        <start-date>{start_date}</start-date>
        <end-date>{start_date}</end-date>
        <duration>12.5</duration>
        <template-name>CPU Profiler</template-name>
      </summary>
    </info>
    <processes><process name="bench" pid="42" path="/usr/bin/bench"/></processes>
    <data>
      {tables}
    </data>
  </run>
</trace-toc>
"#
    )
}

pub(crate) fn toc_xml(start_date: &str, schemas: &[&str]) -> String {
    let tables = schemas
        .iter()
        .map(|s| format!(r#"<table schema="{s}"/>"#))
        .collect::<Vec<_>>()
        .join("\n      ");
    toc_with_tables(start_date, &tables)
}

pub(crate) fn wrap_rows(schema: &str, rows: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<trace-query-result>
<node xpath='//trace-toc[1]/run[1]/data[1]/table[@schema="{schema}"]'><schema name="{schema}"><col><mnemonic>time</mnemonic><name>Sample Time</name><engineering-type>sample-time</engineering-type></col><col><mnemonic>thread</mnemonic><name>Thread</name><engineering-type>thread</engineering-type></col><col><mnemonic>stack</mnemonic><name>Backtrace</name><engineering-type>backtrace</engineering-type></col></schema>
{rows}
</node></trace-query-result>
"#
    )
}

/// Time-profile export; each sample is `(time_ns, leaf symbol, leaf address)` below `main`.
pub(crate) fn time_profile_xml(samples: &[(u64, &str, u64)]) -> String {
    let mut rows = RowWriter::default();
    for &(time_ns, symbol, address) in samples {
        rows.row(time_ns, symbol, address, None);
    }
    wrap_rows("time-profile", &rows.out)
}

/// Counters export; each sample also carries its PMC values.
pub(crate) fn counters_profile_xml(samples: &[(u64, &str, u64, Vec<u64>)]) -> String {
    let mut rows = RowWriter::default();
    for (time_ns, symbol, address, pmc) in samples {
        rows.row(*time_ns, symbol, *address, Some(pmc.as_slice()));
    }
    wrap_rows("counters-profile", &rows.out)
}

#[derive(Default)]
struct RowWriter {
    out: String,
    next_id: u64,
    thread: Option<u64>,
    binary: Option<u64>,
    main_frame: Option<u64>,
    frames: HashMap<(String, u64), u64>,
    backtraces: HashMap<(String, u64), u64>,
}

impl RowWriter {
    fn id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn row(&mut self, time_ns: u64, symbol: &str, address: u64, pmc: Option<&[u64]>) {
        let time_id = self.id();
        let _ = write!(
            self.out,
            r#"<row><sample-time id="{time_id}" fmt="{time_ns}ns">{time_ns}</sample-time>"#
        );
        match self.thread {
            Some(id) => {
                let _ = write!(self.out, r#"<thread ref="{id}"/>"#);
            }
            None => {
                let (thread, tid, process, pid) = (self.id(), self.id(), self.id(), self.id());
                self.thread = Some(thread);
                let _ = write!(
                    self.out,
                    r#"<thread id="{thread}" fmt="Main Thread 0x103"><tid id="{tid}" fmt="0x103">259</tid><process id="{process}" fmt="bench (42)"><pid id="{pid}" fmt="42">42</pid></process></thread>"#
                );
            }
        }
        let weight_id = self.id();
        match pmc {
            None => {
                let _ = write!(
                    self.out,
                    r#"<weight id="{weight_id}" fmt="1.00 ms">1000000</weight>"#
                );
            }
            Some(values) => {
                let pmc_id = self.id();
                let text = values
                    .iter()
                    .map(u64::to_string)
                    .collect::<Vec<_>>()
                    .join(" ");
                let _ = write!(
                    self.out,
                    r#"<pmc-event id="{weight_id}" fmt="1,000">1000</pmc-event><pmc-events id="{pmc_id}">{text}</pmc-events>"#
                );
            }
        }
        self.backtrace(symbol, address);
        self.out.push_str("</row>\n");
    }

    fn backtrace(&mut self, symbol: &str, address: u64) {
        let key = (symbol.to_string(), address);
        if let Some(&id) = self.backtraces.get(&key) {
            let _ = write!(self.out, r#"<backtrace ref="{id}"/>"#);
            return;
        }
        let id = self.id();
        self.backtraces.insert(key, id);
        let _ = write!(self.out, r#"<backtrace id="{id}">"#);
        self.frame(symbol, address);
        match self.main_frame {
            Some(main) => {
                let _ = write!(self.out, r#"<frame ref="{main}"/>"#);
            }
            None => {
                let main = self.id();
                self.main_frame = Some(main);
                let _ = write!(self.out, r#"<frame id="{main}" name="main" addr="0x100000f01">"#);
                self.binary();
                self.out.push_str("</frame>");
            }
        }
        self.out.push_str("</backtrace>");
    }

    fn frame(&mut self, symbol: &str, address: u64) {
        let key = (symbol.to_string(), address);
        if let Some(&id) = self.frames.get(&key) {
            let _ = write!(self.out, r#"<frame ref="{id}"/>"#);
            return;
        }
        let id = self.id();
        self.frames.insert(key, id);
        let _ = write!(
            self.out,
            r#"<frame id="{id}" name="{symbol}" addr="0x{:x}">"#,
            address + 1
        );
        self.binary();
        self.out.push_str("</frame>");
    }

    fn binary(&mut self) {
        match self.binary {
            Some(id) => {
                let _ = write!(self.out, r#"<binary ref="{id}"/>"#);
            }
            None => {
                let id = self.id();
                self.binary = Some(id);
                let _ = write!(
                    self.out,
                    r#"<binary id="{id}" name="libbench.dylib" UUID="4C4C4F0A-5555-3144-A1A2-000000000000" arch="arm64" load-addr="0x100000000" path="/usr/lib/libbench.dylib"/>"#
                );
            }
        }
    }
}
