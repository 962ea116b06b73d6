#![allow(dead_code)]

use anyhow::{Result, bail};
use serial_gateway::{
    command::{CommandOutput, CommandRunner},
    services::bridge::{ChildProcess, ProcessControl},
};
use std::{
    collections::BTreeMap,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

pub type Script = Box<dyn Fn(&str, &[String]) -> CommandOutput + Send + Sync>;

/// Command runner answering from a script and recording every invocation
pub struct FakeSystem {
    script: Script,
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeSystem {
    pub fn new(script: impl Fn(&str, &[String]) -> CommandOutput + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }

    /// Argument lists of `nmcli connection modify` calls
    pub fn modify_calls(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|(program, args)| program == "nmcli" && args.get(1).is_some_and(|a| a == "modify"))
            .map(|(_, args)| args)
            .collect()
    }
}

impl CommandRunner for FakeSystem {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        self.calls
            .lock()
            .unwrap()
            .push((program.to_string(), args.to_vec()));

        Ok((self.script)(program, args))
    }
}

pub fn stdout(text: &str) -> CommandOutput {
    CommandOutput {
        status: Some(0),
        stdout: text.to_string(),
        stderr: String::new(),
    }
}

pub struct FakeChild {
    pid: u32,
    alive: Arc<AtomicBool>,
}

impl ChildProcess for FakeChild {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn has_exited(&mut self) -> bool {
        !self.alive.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Processes {
    next_pid: u32,
    alive: BTreeMap<u32, Arc<AtomicBool>>,
    spawned: Vec<Vec<String>>,
}

/// Process table of a pretend host; clones share the same table
#[derive(Clone, Default)]
pub struct FakeProcessControl {
    processes: Arc<Mutex<Processes>>,
    fail_spawn: Arc<AtomicBool>,
}

impl FakeProcessControl {
    pub fn alive(&self) -> Vec<u32> {
        let processes = self.processes.lock().unwrap();
        processes
            .alive
            .iter()
            .filter(|(_, alive)| alive.load(Ordering::SeqCst))
            .map(|(pid, _)| *pid)
            .collect()
    }

    /// Arguments of every spawn, in order
    pub fn spawned(&self) -> Vec<Vec<String>> {
        self.processes.lock().unwrap().spawned.clone()
    }

    /// Simulate the bridge dying on its own
    pub fn crash(&self, pid: u32) {
        if let Some(alive) = self.processes.lock().unwrap().alive.get(&pid) {
            alive.store(false, Ordering::SeqCst);
        }
    }

    pub fn fail_spawn(&self, fail: bool) {
        self.fail_spawn.store(fail, Ordering::SeqCst);
    }
}

impl ProcessControl for FakeProcessControl {
    fn spawn(&self, _program: &Path, args: &[String]) -> Result<Box<dyn ChildProcess>> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            bail!("executable not found");
        }

        let mut processes = self.processes.lock().unwrap();
        processes.next_pid += 1;
        let pid = 1000 + processes.next_pid;
        let alive = Arc::new(AtomicBool::new(true));

        processes.alive.insert(pid, alive.clone());
        processes.spawned.push(args.to_vec());

        Ok(Box::new(FakeChild { pid, alive }))
    }

    async fn terminate(&self, pid: u32) -> Result<()> {
        match self.processes.lock().unwrap().alive.get(&pid) {
            Some(alive) => {
                alive.store(false, Ordering::SeqCst);
                Ok(())
            }
            None => bail!("no such process: {pid}"),
        }
    }

    async fn terminate_all(&self, _program: &Path) -> Result<bool> {
        let processes = self.processes.lock().unwrap();
        let mut found = false;

        for alive in processes.alive.values() {
            found |= alive.swap(false, Ordering::SeqCst);
        }

        Ok(found)
    }
}
