mod helpers;

mod tests_checkpoint;
