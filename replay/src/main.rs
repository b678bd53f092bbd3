/*
FaF DNS Latency measures DNS query/response round trip times
Copyright (C) 2022  James Bates

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

mod args;
mod replay;
mod statics;
mod trace;

#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: tcmalloc::TCMalloc = tcmalloc::TCMalloc;

pub fn main() -> anyhow::Result<()> {
   let default_filter = if statics::ARGS.daemon {
      "error"
   } else if statics::ARGS.verbose {
      "info"
   } else {
      "warn"
   };
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

   if !statics::ARGS.daemon {
      print_version();
   }

   let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
   let summary = runtime.block_on(replay::go(&statics::ARGS))?;

   if !statics::ARGS.daemon {
      println!(
         "{} events | {} | {} pending -> {} | {} buckets -> {}",
         summary.events,
         summary.stats,
         summary.pending,
         summary.pending_path.display(),
         summary.histogram.len(),
         summary.histogram_path.display(),
      );
   }

   Ok(())
}

fn print_version() {
   println!("{} v{}\n", statics::PROJECT_NAME, statics::VERSION);
}
